//! Product record produced by a crawl.
//!
//! Numeric fields distinguish three situations that the job payload encodes as
//! negative sentinels: the rule has no script for the field, the script ran but
//! nothing usable came back, or a real value (possibly zero) was read. In memory
//! those are enum variants; the sentinel codes only exist at the serde boundary
//! (see [`wire`]).

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Stock value meaning "available, but the page shows no count".
pub const IN_STOCK_UNCOUNTED: i64 = 10_000_000;

/// Currency codes carried by rules and products.
pub mod currency {
    pub const CNY: u32 = 0;
    pub const JPY: u32 = 1;
    pub const USD: u32 = 2;
    pub const GBP: u32 = 3;
    pub const EUR: u32 = 4;
}

/// Sentinel codes used by the job payload schema.
pub mod wire {
    /// The rule defines no script for the field.
    pub const NO_SCRIPT: i64 = -1;
    /// The script ran but its result could not be read or parsed.
    pub const NO_VALUE: i64 = -2;
    /// The price is a range carried in `price_low`/`price_high`.
    pub const RANGE_PRICE: i64 = -3;
}

/// A field value together with the reason it may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Extracted<T> {
    /// The rule has no script for this field.
    #[default]
    Absent,
    /// A script exists but extraction failed.
    Failed,
    Value(T),
}

impl<T> Extracted<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Extracted::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Extracted::Value(_))
    }
}

impl Extracted<i64> {
    /// Negative values collide with the sentinel codes and are written as
    /// [`wire::NO_VALUE`].
    pub fn to_code(self) -> i64 {
        match self {
            Extracted::Absent => wire::NO_SCRIPT,
            Extracted::Failed => wire::NO_VALUE,
            Extracted::Value(value) if value < 0 => wire::NO_VALUE,
            Extracted::Value(value) => value,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            wire::NO_SCRIPT => Extracted::Absent,
            wire::NO_VALUE => Extracted::Failed,
            value => Extracted::Value(value),
        }
    }
}

/// Product price: a single value or a low/high range.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Price {
    #[default]
    Absent,
    Failed,
    Single(f64),
    Range { low: f64, high: f64 },
}

impl Price {
    /// Whether the price can be reported.
    ///
    /// A `0-0` range is what a page yields before its price widget renders, so it
    /// does not count.
    pub fn is_defined(&self) -> bool {
        match self {
            Price::Single(_) => true,
            Price::Range { low, high } => *low != 0.0 || *high != 0.0,
            Price::Absent | Price::Failed => false,
        }
    }

    /// Encode into the `(price, price_low, price_high)` wire triple.
    pub fn to_wire(self) -> (f64, f64, f64) {
        match self {
            Price::Absent => (wire::NO_SCRIPT as f64, 0.0, 0.0),
            Price::Failed => (wire::NO_VALUE as f64, 0.0, 0.0),
            Price::Single(value) => (value, 0.0, 0.0),
            Price::Range { low, high } => (wire::RANGE_PRICE as f64, low, high),
        }
    }

    pub fn from_wire(price: f64, low: f64, high: f64) -> Self {
        if price == wire::NO_SCRIPT as f64 {
            Price::Absent
        } else if price == wire::NO_VALUE as f64 {
            Price::Failed
        } else if price == wire::RANGE_PRICE as f64 {
            Price::Range { low, high }
        } else {
            Price::Single(price)
        }
    }
}

/// Review counters.
///
/// Only `total` carries a sentinel; the bucket counters are meaningless without it
/// and default to zero. Sites that rate good/neutral/bad use `star5`/`star3`/`star1`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "CommentsWire", into = "CommentsWire")]
pub struct Comments {
    pub total: Extracted<i64>,
    pub star5: i64,
    pub star4: i64,
    pub star3: i64,
    pub star2: i64,
    pub star1: i64,
    /// Reviews with pictures.
    pub image: i64,
    /// Follow-up reviews.
    pub append: i64,
}

#[derive(Serialize, Deserialize)]
struct CommentsWire {
    #[serde(default = "no_script")]
    total: i64,
    #[serde(default)]
    star5: i64,
    #[serde(default)]
    star4: i64,
    #[serde(default)]
    star3: i64,
    #[serde(default)]
    star2: i64,
    #[serde(default)]
    star1: i64,
    #[serde(default)]
    image: i64,
    #[serde(default)]
    append: i64,
}

impl From<CommentsWire> for Comments {
    fn from(raw: CommentsWire) -> Self {
        Self {
            total: Extracted::from_code(raw.total),
            star5: raw.star5,
            star4: raw.star4,
            star3: raw.star3,
            star2: raw.star2,
            star1: raw.star1,
            image: raw.image,
            append: raw.append,
        }
    }
}

impl From<Comments> for CommentsWire {
    fn from(comments: Comments) -> Self {
        Self {
            total: comments.total.to_code(),
            star5: comments.star5,
            star4: comments.star4,
            star3: comments.star3,
            star2: comments.star2,
            star1: comments.star1,
            image: comments.image,
            append: comments.append,
        }
    }
}

fn no_script() -> i64 {
    wire::NO_SCRIPT
}

fn no_script_price() -> f64 {
    wire::NO_SCRIPT as f64
}

/// Structured extraction result for one product page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "ProductWire", into = "ProductWire")]
pub struct Product {
    pub id: String,
    pub url: String,
    pub short_url: String,
    pub source: u32,
    pub title: String,
    pub currency: u32,
    pub price: Price,
    pub stock: Extracted<i64>,
    /// Sales count; the period (monthly, total) depends on the site.
    pub sales: Extracted<i64>,
    /// Category path, segments joined with `_`.
    pub category: String,
    pub comments: Comments,
    /// When the product was crawled.
    pub update_time: Option<NaiveDateTime>,
}

impl Product {
    /// An empty product whose scripted fields are all marked absent.
    pub fn new() -> Self {
        Self::default()
    }

    /// A product reference carrying only an ID and a URL, as queued for re-crawl.
    pub fn reference(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    /// Whether the crawl produced enough to report: an identifier and a price.
    pub fn is_complete(&self) -> bool {
        self.has_id() && self.price.is_defined()
    }
}

#[derive(Serialize, Deserialize)]
struct ProductWire {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    short_url: String,
    #[serde(default)]
    source: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    title: String,
    #[serde(default)]
    currency: u32,
    #[serde(default = "no_script_price")]
    price: f64,
    #[serde(default)]
    price_low: f64,
    #[serde(default)]
    price_high: f64,
    #[serde(default = "no_script")]
    stock: i64,
    #[serde(default = "no_script")]
    sales: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    category: String,
    #[serde(default)]
    comments: Comments,
    #[serde(
        default,
        with = "crate::time::optional_datetime",
        skip_serializing_if = "Option::is_none"
    )]
    update_time: Option<NaiveDateTime>,
}

impl From<ProductWire> for Product {
    fn from(raw: ProductWire) -> Self {
        Self {
            id: raw.id,
            url: raw.url,
            short_url: raw.short_url,
            source: raw.source,
            title: raw.title,
            currency: raw.currency,
            price: Price::from_wire(raw.price, raw.price_low, raw.price_high),
            stock: Extracted::from_code(raw.stock),
            sales: Extracted::from_code(raw.sales),
            category: raw.category,
            comments: raw.comments,
            update_time: raw.update_time,
        }
    }
}

impl From<Product> for ProductWire {
    fn from(product: Product) -> Self {
        let (price, price_low, price_high) = product.price.to_wire();
        Self {
            id: product.id,
            url: product.url,
            short_url: product.short_url,
            source: product.source,
            title: product.title,
            currency: product.currency,
            price,
            price_low,
            price_high,
            stock: product.stock.to_code(),
            sales: product.sales.to_code(),
            category: product.category,
            comments: product.comments,
            update_time: product.update_time,
        }
    }
}
