//! Fair ordering of per-provider result lists.

/// Round-robin merge: item `i` of every list in list order, then `i + 1`.
pub fn interleave<T>(lists: Vec<Vec<T>>) -> Vec<T> {
    let total = lists.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    let mut cursors: Vec<_> = lists.into_iter().map(Vec::into_iter).collect();
    while out.len() < total {
        for cursor in &mut cursors {
            if let Some(item) = cursor.next() {
                out.push(item);
            }
        }
    }
    out
}
