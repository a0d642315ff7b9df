//! Client for a browser's remote-debugging protocol.
//!
//! A [`Browser`] is the endpoint's HTTP control address. Each [`Tab`] owns one
//! websocket with its own read loop, write loop, command-id counter, pending
//! call table and bounded event queue, so tabs never share correlation state.
//!
//! ```no_run
//! # async fn demo() -> pricewatch_cdp::Result<()> {
//! use pricewatch_cdp::{Browser, methods};
//!
//! let browser = Browser::attach("127.0.0.1", 9222)?;
//! let tab = browser.new_tab().await?;
//! tab.subscribe(methods::PAGE_LOAD_EVENT_FIRED);
//! tab.enable_page().await?;
//! tab.navigate("https://example.com").await?;
//! tab.wait_for(methods::PAGE_LOAD_EVENT_FIRED).await;
//! let title = tab.evaluate("document.title").await?;
//! println!("{}", title.as_text());
//! tab.close().await;
//! # Ok(())
//! # }
//! ```

mod browser;
mod codec;
mod connection;
mod error;
mod router;
mod tab;

#[cfg(any(test, feature = "test-utils"))]
pub mod testkit;

pub use browser::{Browser, BrowserVersion, DEFAULT_DEBUGGING_PORT};
pub use codec::{
    Command, Event, EventOrigin, FrameError, Inbound, RemoteError, RemoteValue, Response, decode,
    methods,
};
pub use error::{CdpError, Result};
pub use router::OverflowPolicy;
pub use tab::{Tab, TabConfig, TabMeta};
