use std::collections::BTreeMap;

/// partition membership vector into groups of indexes
/// # Arguments
/// * `membership` - a vector of membership (E.g., cluster assignment)
/// # Returns
/// An ordered map: cluster/group name -> indexes of the elements
pub fn partition_by_membership<T>(membership: &[T]) -> BTreeMap<T, Vec<usize>>
where
    T: Ord + Clone,
{
    let mut groups: BTreeMap<T, Vec<usize>> = BTreeMap::new();
    for (elem, k) in membership.iter().enumerate() {
        groups.entry(k.clone()).or_default().push(elem);
    }
    groups
}

/// Generate minibatch intervals
/// * `ntot` - number of total samples
/// * `batch_size` - the size of each batch
pub fn generate_minibatch_intervals(ntot: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = batch_size.max(1);
    (0..ntot.div_ceil(batch_size))
        .map(|b| (b * batch_size, ((b + 1) * batch_size).min(ntot)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minibatch_intervals_cover_everything() {
        assert_eq!(
            generate_minibatch_intervals(7, 3),
            vec![(0, 3), (3, 6), (6, 7)]
        );
        assert!(generate_minibatch_intervals(0, 3).is_empty());
    }

    #[test]
    fn partition_groups_indexes() {
        let groups = partition_by_membership(&[1, 0, 1, 2]);
        assert_eq!(groups[&0], vec![1]);
        assert_eq!(groups[&1], vec![0, 2]);
        assert_eq!(groups.len(), 3);
    }
}
