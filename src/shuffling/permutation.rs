use rand::seq::SliceRandom;
use rand::{CryptoRng, RngCore};

/// Uniform permutation of `0..len`; entry `i` is the source position of
/// output position `i`.
pub fn random_permutation<R: RngCore + CryptoRng>(rng: &mut R, len: usize) -> Vec<u32> {
    let mut indices: Vec<u32> = (0..len as u32).collect();
    indices.shuffle(rng);
    indices
}

pub fn is_permutation(indices: &[u32], len: usize) -> bool {
    if indices.len() != len {
        return false;
    }
    let mut seen = vec![false; len];
    for &index in indices {
        match seen.get_mut(index as usize) {
            Some(slot) if !*slot => *slot = true,
            _ => return false,
        }
    }
    true
}

/// `out[i] = items[indices[i]]`, or `None` if `indices` is not a permutation
/// of the item positions.
pub fn apply_permutation<T: Clone>(items: &[T], indices: &[u32]) -> Option<Vec<T>> {
    if !is_permutation(indices, items.len()) {
        return None;
    }
    Some(
        indices
            .iter()
            .map(|&index| items[index as usize].clone())
            .collect(),
    )
}
