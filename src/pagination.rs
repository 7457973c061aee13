//! Lazy cursor iteration over list endpoints (spec §4.I).
//!
//! `PageIterator` holds the current page in memory and fetches the next one
//! only once the caller walks past the end of what it already has. A
//! server-returned `next_marker` is preferred over offset arithmetic when
//! both are present, since markers survive concurrent inserts/deletes on
//! the server side better than a plain offset does.

use std::future::Future;
use std::pin::Pin;

use crate::context::CallContext;
use crate::error::{Error, Result};

/// One page of results from a list endpoint (spec §3 "Log Entry / Paginated Page").
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub offset: u64,
    pub limit: u64,
    pub total: Option<u64>,
    pub has_more: bool,
    pub next_marker: Option<String>,
}

/// Where the next page should be fetched from.
#[derive(Debug, Clone)]
enum Cursor {
    Offset(u64),
    Marker(String),
}

type FetchFut<'a, T> = Pin<Box<dyn Future<Output = Result<Page<T>>> + Send + 'a>>;

/// A fetcher closure: given either an offset or a marker, returns the next page.
pub trait PageFetcher<T>: Send + Sync {
    fn fetch_offset<'a>(&'a self, ctx: &'a CallContext, offset: u64, limit: u64) -> FetchFut<'a, T>;
    fn fetch_marker<'a>(&'a self, ctx: &'a CallContext, marker: &'a str, limit: u64) -> FetchFut<'a, T>;
}

/// Lazy, restartable-only-by-recreating iterator over a paginated list
/// endpoint. `next` advances one item at a time, fetching a fresh page
/// transparently whenever the current one is exhausted and the server
/// indicated more are available.
pub struct PageIterator<T, F: PageFetcher<T>> {
    fetcher: F,
    limit: u64,
    page: Option<Page<T>>,
    index_in_page: usize,
    done: bool,
    err: Option<Error>,
}

impl<T, F: PageFetcher<T>> PageIterator<T, F> {
    pub fn new(fetcher: F, limit: u64) -> Self {
        PageIterator {
            fetcher,
            limit,
            page: None,
            index_in_page: 0,
            done: false,
            err: None,
        }
    }

    fn cursor_for_next_page(&self) -> Cursor {
        let page = self.page.as_ref().expect("cursor requested with no page loaded");
        match &page.next_marker {
            Some(marker) => Cursor::Marker(marker.clone()),
            None => Cursor::Offset(page.offset + page.items.len() as u64),
        }
    }

    async fn load_first_page(&mut self, ctx: &CallContext) -> Result<()> {
        let page = self.fetcher.fetch_offset(ctx, 0, self.limit).await?;
        self.page = Some(page);
        self.index_in_page = 0;
        Ok(())
    }

    async fn load_next_page(&mut self, ctx: &CallContext) -> Result<()> {
        let cursor = self.cursor_for_next_page();
        let page = match cursor {
            Cursor::Offset(offset) => self.fetcher.fetch_offset(ctx, offset, self.limit).await?,
            Cursor::Marker(marker) => self.fetcher.fetch_marker(ctx, &marker, self.limit).await?,
        };
        self.page = Some(page);
        self.index_in_page = 0;
        Ok(())
    }

    /// Advances to the next item, fetching a new page only when needed.
    /// Returns `false` once the iterator is exhausted (check `err()` to
    /// distinguish "ran out of items" from "a fetch failed").
    pub async fn next(&mut self, ctx: &CallContext) -> bool {
        if self.done || self.err.is_some() {
            return false;
        }

        if self.page.is_none() {
            if let Err(e) = self.load_first_page(ctx).await {
                self.err = Some(e);
                return false;
            }
        }

        loop {
            let page = self.page.as_ref().expect("page just loaded above");
            if self.index_in_page < page.items.len() {
                return true;
            }
            if !page.has_more {
                self.done = true;
                return false;
            }
            if let Err(e) = self.load_next_page(ctx).await {
                self.err = Some(e);
                return false;
            }
            // Servers may legitimately return an empty page with
            // `has_more: true` mid-stream; loop rather than assume the
            // fresh page is non-empty.
        }
    }

    pub fn current(&self) -> Option<&T> {
        self.page.as_ref().and_then(|p| p.items.get(self.index_in_page))
    }

    /// Consumes the current item so callers can collect owned values.
    /// Only valid immediately after `next` returned `true`.
    pub fn take_current(&mut self) -> Option<T>
    where
        T: Clone,
    {
        let item = self.current().cloned();
        self.index_in_page += 1;
        item
    }

    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }
}
