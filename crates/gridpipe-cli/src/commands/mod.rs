pub mod check;
pub mod count;
pub mod package;
pub mod show;
