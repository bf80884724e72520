const INDENT_SIZE: usize = 2;

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

pub fn indent(depth: usize) -> String {
    " ".repeat(depth * INDENT_SIZE)
}

/// Returns `true` if `perm` is a permutation of `0..perm.len()`.
pub fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &p in perm {
        if p >= perm.len() || seen[p] {
            return false;
        }
        seen[p] = true;
    }
    true
}

/// Returns `v` reordered so that `result[i] == v[perm[i]]`.
pub fn apply_permutation<T: Clone>(v: &[T], perm: &[usize]) -> Vec<T> {
    debug_assert_eq!(v.len(), perm.len());
    perm.iter().map(|&p| v[p].clone()).collect()
}

pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
    inverse
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_is_permutation() {
        assert!(is_permutation(&[1, 0, 2]));
        assert!(!is_permutation(&[1, 1]));
        assert!(!is_permutation(&[0, 2]));
        assert!(is_permutation(&[]));
    }

    proptest! {
        #[test]
        fn test_invert_permutation_composes_to_identity(
            perm in (1usize..6).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
        ) {
            let inverse = invert_permutation(&perm);
            let v: Vec<usize> = (0..perm.len()).collect();
            let permuted = apply_permutation(&v, &perm);
            prop_assert_eq!(apply_permutation(&permuted, &inverse), v);
        }
    }
}
