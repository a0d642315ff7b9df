//! Dedup cache of recently crawled products.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use pricewatch_models::Product;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};

const PRODUCTS: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("products");

/// Last known crawl result per product ID.
pub trait ProductCache: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Product>>;
    fn put(&self, product: &Product) -> Result<()>;
}

/// [`ProductCache`] stored in a `redb` file, one JSON value per product ID.
#[derive(Debug, Clone)]
pub struct RedbProductCache {
    db: Arc<Database>,
}

impl RedbProductCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {:?}", parent))?;
        }
        let db = Database::create(path)
            .with_context(|| format!("Failed to open cache at {:?}", path))?;
        Self::new(Arc::new(db))
    }

    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(PRODUCTS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn len(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PRODUCTS)?;
        Ok(table.len()? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl ProductCache for RedbProductCache {
    fn get(&self, id: &str) -> Result<Option<Product>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PRODUCTS)?;
        let Some(value) = table.get(id)? else {
            return Ok(None);
        };
        let product = serde_json::from_slice(value.value())
            .with_context(|| format!("Corrupt cache entry for product {}", id))?;
        Ok(Some(product))
    }

    fn put(&self, product: &Product) -> Result<()> {
        let data = serde_json::to_vec(product)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PRODUCTS)?;
            table.insert(product.id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
