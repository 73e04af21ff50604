pub mod write;

/// Returns the qualifiers of the synthetic columns of a row.
pub(crate) fn synthetic_qualifiers(columns: u64) -> Vec<String> {
    (1..=columns)
        .map(|i| format!("some_random_value_{i}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_qualifiers() {
        assert_eq!(
            synthetic_qualifiers(3),
            [
                "some_random_value_1",
                "some_random_value_2",
                "some_random_value_3"
            ]
        );
        assert!(synthetic_qualifiers(0).is_empty());
    }
}
