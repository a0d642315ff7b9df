//! Pricewatch Models - data types shared by the crawler and the job queue.
//!
//! This crate defines:
//! - `Product` and its sentinel-aware field types (`Price`, `Extracted`, `Comments`)
//! - `Message`, `Payload` and `Task`, the job payload exchanged with the queue
//! - The fixed textual date-time format used by every timestamp on the wire

pub mod product;
pub mod task;
pub mod time;

pub use product::{Comments, Extracted, IN_STOCK_UNCOUNTED, Price, Product, currency, wire};
pub use task::{Message, Payload, Task};
pub use time::{DATETIME_FORMAT, now};
