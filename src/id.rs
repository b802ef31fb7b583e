//! Unique identifiers for events, audit logs and generated group IDs

/// Source of unique identifiers
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// UUID v4 rendered without hyphens (32 lowercase hex chars)
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::is_uuid4_without_hyphens;

    #[test]
    fn test_uuid_generator_format() {
        let id = UuidGenerator.generate();
        assert_eq!(id.len(), 32);
        assert!(!id.contains('-'));
        assert!(is_uuid4_without_hyphens(&id));
    }

    #[test]
    fn test_uuid_generator_unique() {
        assert_ne!(UuidGenerator.generate(), UuidGenerator.generate());
    }
}
