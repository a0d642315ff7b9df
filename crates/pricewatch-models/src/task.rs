//! Job payload exchanged with the queue.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::product::Product;

/// An inbound chat message that may contain a product link.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Raw content; left empty when `url` is set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
}

/// One unit of work and, once crawled, its result.
///
/// When both are present the product was crawled from that message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<Product>,
}

impl Payload {
    pub fn crawled_message(message: Message, product: Product) -> Self {
        Self {
            message: Some(message),
            product: Some(product),
        }
    }

    pub fn crawled_product(product: Product) -> Self {
        Self {
            message: None,
            product: Some(product),
        }
    }
}

/// A batch of payloads.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Task {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Set by the dispatcher that created the task.
    #[serde(
        default,
        with = "crate::time::optional_datetime",
        skip_serializing_if = "Option::is_none"
    )]
    pub create_time: Option<NaiveDateTime>,
    /// Set when the results are reported back.
    #[serde(
        default,
        with = "crate::time::optional_datetime",
        skip_serializing_if = "Option::is_none"
    )]
    pub report_time: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payloads: Vec<Payload>,
}

impl Task {
    /// The report for this task: same identity, new payloads, stamped now.
    pub fn report(&self, payloads: Vec<Payload>) -> Self {
        Self {
            id: self.id.clone(),
            create_time: self.create_time,
            report_time: Some(crate::time::now()),
            payloads,
        }
    }
}
