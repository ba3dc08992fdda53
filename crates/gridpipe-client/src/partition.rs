use gridpipe_ir::Row;

/// Split rows into `n` disjoint, contiguous, order-preserving partitions.
/// Sizes differ by at most one; earlier partitions take the remainder. When
/// there are fewer rows than partitions, the tail partitions are empty.
pub fn partition_rows(rows: Vec<Row>, n: u64) -> Vec<Vec<Row>> {
    let n = n.max(1) as usize;
    let total = rows.len();
    let base = total / n;
    let extra = total % n;

    let mut parts = Vec::with_capacity(n);
    let mut rest = rows;
    for i in 0..n {
        let take = base + usize::from(i < extra);
        let tail = rest.split_off(take.min(rest.len()));
        parts.push(rest);
        rest = tail;
    }
    parts
}
