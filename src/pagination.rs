//! Endless (cursor) and offset pagination.

use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::list_cache::Listed;
use crate::model::Cursor;
use serde::Serialize;
use std::future::Future;

/// Request for one page of a reverse-chronological list.
///
/// With no cursor the newest page is returned. `newer_than` asks for
/// everything newer than a known item (pull-to-refresh) and takes
/// precedence over `older_than`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndlessRequest {
    pub older_than: Option<Cursor>,
    pub newer_than: Option<Cursor>,
    pub page_size: Option<usize>,
}

impl EndlessRequest {
    /// Newest page at the default size.
    pub fn first() -> Self {
        Self::default()
    }

    pub fn older_than(cursor: Cursor) -> Self {
        EndlessRequest {
            older_than: Some(cursor),
            ..Self::default()
        }
    }

    pub fn newer_than(cursor: Cursor) -> Self {
        EndlessRequest {
            newer_than: Some(cursor),
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// Where the items of a page came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSource {
    CacheBacked,
    StoreFallback,
}

/// One page of an endless list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_next: bool,
    /// Cursor of the last item; pass as `older_than` for the next page.
    pub next_cursor: Option<Cursor>,
    pub source: PageSource,
}

impl<T> Page<T> {
    /// Swap the items, keeping the paging state of the original page.
    pub fn with_items<U>(self, items: Vec<U>) -> Page<U> {
        Page {
            items,
            has_next: self.has_next,
            next_cursor: self.next_cursor,
            source: self.source,
        }
    }
}

/// Pages over a cached list, reading past the cache horizon from the store.
///
/// A page is cache-backed while the cached list can satisfy it. Once the
/// cached slice older than the cursor runs short and the cached list is at
/// its bound (so older rows may exist beyond it), the page is read from the
/// store instead. Every request without a cursor starts cache-backed again.
#[derive(Clone, Copy, Debug)]
pub struct EndlessPaginator {
    page_size: usize,
    max_page_size: usize,
}

impl EndlessPaginator {
    pub fn new(page_size: usize, max_page_size: usize) -> Self {
        let max_page_size = max_page_size.max(1);
        EndlessPaginator {
            page_size: page_size.clamp(1, max_page_size),
            max_page_size,
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(config.endless_page_size, config.endless_max_page_size)
    }

    /// Effective page size for a request, clamped to `1..=max`.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.page_size)
            .clamp(1, self.max_page_size)
    }

    /// Build a page from a newest-first cached list.
    ///
    /// `bound` is the list cache bound; `fallback(before, limit)` must return
    /// the newest-first store rows strictly older than `before`.
    pub async fn paginate<T, F, Fut>(
        &self,
        cached: Vec<T>,
        bound: usize,
        request: &EndlessRequest,
        fallback: F,
    ) -> Result<Page<T>>
    where
        T: Listed,
        F: FnOnce(Option<Cursor>, usize) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let page_size = self.page_size(request.page_size);

        if let Some(newer_than) = request.newer_than {
            let items: Vec<T> = cached
                .into_iter()
                .take_while(|item| item.cursor() > newer_than)
                .collect();
            return Ok(cache_page(items, false));
        }

        let cached_len = cached.len();
        let mut older: Vec<T> = match request.older_than {
            Some(cursor) => cached
                .into_iter()
                .skip_while(|item| item.cursor() >= cursor)
                .collect(),
            None => cached,
        };

        if older.len() > page_size {
            older.truncate(page_size);
            return Ok(cache_page(older, true));
        }

        if cached_len < bound {
            // The cache holds the whole list, so this is its end.
            return Ok(cache_page(older, false));
        }

        debug!(
            "» Cached slice exhausted at bound {}, reading page from store",
            bound
        );
        let items = fallback(request.older_than, page_size).await?;
        let has_next = items.len() == page_size;
        let next_cursor = items.last().map(Listed::cursor);
        Ok(Page {
            items,
            has_next,
            next_cursor,
            source: PageSource::StoreFallback,
        })
    }
}

fn cache_page<T: Listed>(items: Vec<T>, has_next: bool) -> Page<T> {
    let next_cursor = items.last().map(Listed::cursor);
    Page {
        items,
        has_next,
        next_cursor,
        source: PageSource::CacheBacked,
    }
}

/// Page-number pagination with a client-adjustable size.
#[derive(Clone, Copy, Debug)]
pub struct OffsetPaginator {
    page_size: usize,
    max_page_size: usize,
}

/// Resolved slice of an offset-paginated list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageWindow {
    pub page_number: usize,
    pub page_size: usize,
    pub offset: usize,
    pub total_pages: usize,
    pub total_results: usize,
}

impl PageWindow {
    pub fn has_next_page(&self) -> bool {
        self.page_number < self.total_pages
    }

    pub fn into_page<T>(self, items: Vec<T>) -> OffsetPage<T> {
        OffsetPage {
            total_pages: self.total_pages,
            total_results: self.total_results,
            page_number: self.page_number,
            has_next_page: self.has_next_page(),
            items,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OffsetPage<T> {
    pub total_pages: usize,
    pub total_results: usize,
    pub page_number: usize,
    pub has_next_page: bool,
    pub items: Vec<T>,
}

impl OffsetPaginator {
    pub fn new(page_size: usize, max_page_size: usize) -> Self {
        let max_page_size = max_page_size.max(1);
        OffsetPaginator {
            page_size: page_size.clamp(1, max_page_size),
            max_page_size,
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(config.offset_page_size, config.offset_max_page_size)
    }

    /// Resolve `page` (1-based, default 1) of a list of `total` rows.
    ///
    /// Sizes above the maximum are clamped. The first page of an empty list
    /// is valid; any page past the last is `Error::NotFound`.
    pub fn window(&self, page: Option<usize>, size: Option<usize>, total: usize) -> Result<PageWindow> {
        let page_size = size.unwrap_or(self.page_size).clamp(1, self.max_page_size);
        let page_number = page.unwrap_or(1);
        let total_pages = total.div_ceil(page_size).max(1);

        if page_number == 0 || page_number > total_pages {
            return Err(Error::not_found("page", page_number));
        }

        Ok(PageWindow {
            page_number,
            page_size,
            offset: (page_number - 1) * page_size,
            total_pages,
            total_results: total,
        })
    }
}
