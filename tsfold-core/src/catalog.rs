//! Schema lookup used to cross-check chunk types during merges

use crate::{DataType, SeriesKey};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Series → value type lookup
pub trait SchemaLookup: Send + Sync {
    /// Registered type, or `None` if the catalog does not know the series
    fn data_type(&self, series: &SeriesKey) -> Option<DataType>;
}

/// Catalog that knows no series; file types are trusted as written
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenSchema;

impl SchemaLookup for OpenSchema {
    fn data_type(&self, _series: &SeriesKey) -> Option<DataType> {
        None
    }
}

/// In-memory catalog
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    types: RwLock<HashMap<SeriesKey, DataType>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the type of a series
    pub fn register(&self, series: SeriesKey, data_type: DataType) {
        self.types.write().insert(series, data_type);
    }

    pub fn remove(&self, series: &SeriesKey) -> Option<DataType> {
        self.types.write().remove(series)
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}

impl SchemaLookup for SchemaCatalog {
    fn data_type(&self, series: &SeriesKey) -> Option<DataType> {
        self.types.read().get(series).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        let catalog = SchemaCatalog::new();
        let key = SeriesKey::new("root.sg.d0", "s0");
        assert_eq!(catalog.data_type(&key), None);

        catalog.register(key.clone(), DataType::Int64);
        assert_eq!(catalog.data_type(&key), Some(DataType::Int64));
        assert_eq!(catalog.len(), 1);

        assert_eq!(catalog.remove(&key), Some(DataType::Int64));
        assert!(catalog.is_empty());
        assert_eq!(OpenSchema.data_type(&key), None);
    }
}
