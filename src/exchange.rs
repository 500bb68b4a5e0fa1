//! Coordinator-side exchange: the sink that pulls result pages from the
//! output buffers of a query's output stage.
//!
//! [`ExchangeClient`] is the seam a remote (HTTP-pulling) implementation
//! would fill; [`LocalExchangeClient`] is the in-process implementation
//! backing the local execution collaborator. It is a bounded buffer:
//! producers block when the consumer falls behind, which is also what
//! keeps a large query in RUNNING while a client pages through it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// A batch of rows produced by workers, already in wire form.
#[derive(Debug, Clone)]
pub struct Page {
    pub rows: Vec<Vec<serde_json::Value>>,
    pub size_bytes: usize,
}

impl Page {
    pub fn new(rows: Vec<Vec<serde_json::Value>>) -> Self {
        let size_bytes = rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|value| match value {
                        serde_json::Value::String(s) => s.len() + 8,
                        _ => 8,
                    })
                    .sum::<usize>()
            })
            .sum();
        Self { rows, size_bytes }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Pulls pages for one query. All methods are safe to call after close;
/// they become no-ops / return None.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Register the location of a finalized task output buffer.
    fn add_location(&self, uri: &str);

    /// No further locations will be registered.
    fn no_more_locations(&self);

    /// Non-blocking: next page if one is buffered.
    fn poll_page(&self) -> Option<Page>;

    /// Wait up to `timeout` for a page.
    async fn wait_for_page(&self, timeout: Duration) -> Option<Page>;

    /// True once no page is buffered and none can arrive.
    fn is_finished(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Release buffered pages and unblock producers and consumers.
    fn close(&self);
}

const DEFAULT_BUFFER_CAPACITY: usize = 16;

struct ExchangeBuffer {
    pages: VecDeque<Page>,
    locations: HashSet<String>,
    no_more_locations: bool,
    producer_finished: bool,
    closed: bool,
}

pub struct LocalExchangeClient {
    buffer: Mutex<ExchangeBuffer>,
    capacity: usize,
    page_added: Notify,
    space_freed: Notify,
}

impl Default for LocalExchangeClient {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl LocalExchangeClient {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(ExchangeBuffer {
                pages: VecDeque::new(),
                locations: HashSet::new(),
                no_more_locations: false,
                producer_finished: false,
                closed: false,
            }),
            capacity: capacity.max(1),
            page_added: Notify::new(),
            space_freed: Notify::new(),
        }
    }

    /// Producer side: enqueue a page, waiting for buffer space. Returns
    /// false once the exchange is closed (the producer should stop).
    pub async fn publish(&self, page: Page) -> bool {
        loop {
            let waiter = self.space_freed.notified();
            {
                let mut buffer = self.buffer.lock();
                if buffer.closed {
                    return false;
                }
                if buffer.pages.len() < self.capacity {
                    buffer.pages.push_back(page);
                    drop(buffer);
                    self.page_added.notify_waiters();
                    return true;
                }
            }
            waiter.await;
        }
    }

    /// Producer side: no further pages will be published.
    pub fn finish(&self) {
        self.buffer.lock().producer_finished = true;
        self.page_added.notify_waiters();
    }

    pub fn buffered_pages(&self) -> usize {
        self.buffer.lock().pages.len()
    }

    pub fn locations(&self) -> Vec<String> {
        self.buffer.lock().locations.iter().cloned().collect()
    }
}

#[async_trait]
impl ExchangeClient for LocalExchangeClient {
    fn add_location(&self, uri: &str) {
        let mut buffer = self.buffer.lock();
        if !buffer.closed && !buffer.no_more_locations {
            buffer.locations.insert(uri.to_string());
        }
    }

    fn no_more_locations(&self) {
        self.buffer.lock().no_more_locations = true;
        self.page_added.notify_waiters();
    }

    fn poll_page(&self) -> Option<Page> {
        let mut buffer = self.buffer.lock();
        let page = buffer.pages.pop_front();
        if page.is_some() {
            drop(buffer);
            self.space_freed.notify_waiters();
        }
        page
    }

    async fn wait_for_page(&self, timeout: Duration) -> Option<Page> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let waiter = self.page_added.notified();
            if let Some(page) = self.poll_page() {
                return Some(page);
            }
            if self.is_finished() || self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, waiter).await.is_err() {
                return self.poll_page();
            }
        }
    }

    fn is_finished(&self) -> bool {
        let buffer = self.buffer.lock();
        buffer.pages.is_empty() && (buffer.producer_finished || buffer.closed)
    }

    fn is_closed(&self) -> bool {
        self.buffer.lock().closed
    }

    fn close(&self) {
        let mut buffer = self.buffer.lock();
        buffer.closed = true;
        buffer.pages.clear();
        drop(buffer);
        self.page_added.notify_waiters();
        self.space_freed.notify_waiters();
    }
}

/// Closing on drop keeps producers from blocking forever when the
/// consumer disappears without an explicit close.
impl Drop for LocalExchangeClient {
    fn drop(&mut self) {
        self.close();
    }
}

pub type SharedExchangeClient = Arc<dyn ExchangeClient>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(n: i64) -> Page {
        Page::new(vec![vec![json!(n)]])
    }

    #[tokio::test]
    async fn test_publish_then_poll() {
        let exchange = LocalExchangeClient::new(4);
        assert!(exchange.publish(page(1)).await);
        assert!(exchange.publish(page(2)).await);

        assert_eq!(exchange.poll_page().unwrap().rows[0][0], json!(1));
        assert_eq!(exchange.poll_page().unwrap().rows[0][0], json!(2));
        assert!(exchange.poll_page().is_none());
        assert!(!exchange.is_finished());
    }

    #[tokio::test]
    async fn test_finished_after_producer_done_and_drained() {
        let exchange = LocalExchangeClient::new(4);
        exchange.publish(page(1)).await;
        exchange.finish();
        assert!(!exchange.is_finished());
        exchange.poll_page();
        assert!(exchange.is_finished());
    }

    #[tokio::test]
    async fn test_bounded_publish_blocks_until_drained() {
        let exchange = Arc::new(LocalExchangeClient::new(1));
        exchange.publish(page(1)).await;

        let producer = {
            let exchange = exchange.clone();
            tokio::spawn(async move { exchange.publish(page(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        exchange.poll_page();
        assert!(producer.await.unwrap());
        assert_eq!(exchange.buffered_pages(), 1);
    }

    #[tokio::test]
    async fn test_close_unblocks_producer() {
        let exchange = Arc::new(LocalExchangeClient::new(1));
        exchange.publish(page(1)).await;

        let producer = {
            let exchange = exchange.clone();
            tokio::spawn(async move { exchange.publish(page(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        exchange.close();
        assert!(!producer.await.unwrap());
        assert!(exchange.is_finished());
        assert!(exchange.poll_page().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_page_times_out() {
        let exchange = LocalExchangeClient::new(4);
        let start = tokio::time::Instant::now();
        let result = exchange.wait_for_page(Duration::from_millis(30)).await;
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_wait_for_page_wakes_on_publish() {
        let exchange = Arc::new(LocalExchangeClient::new(4));
        let consumer = {
            let exchange = exchange.clone();
            tokio::spawn(async move { exchange.wait_for_page(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        exchange.publish(page(7)).await;
        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.rows[0][0], json!(7));
    }

    #[tokio::test]
    async fn test_locations_ignored_after_no_more() {
        let exchange = LocalExchangeClient::new(4);
        exchange.add_location("http://worker-1/task/0/results");
        exchange.no_more_locations();
        exchange.add_location("http://worker-2/task/0/results");
        assert_eq!(exchange.locations().len(), 1);
    }
}
