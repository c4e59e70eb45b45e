// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Page-number pagination for list operations.

use serde::{Deserialize, Serialize};

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page size a caller may ask for.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Which page of a list to return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageOptions {
    /// 1-based page number. Defaults to 1.
    #[serde(default, rename = "page[number]")]
    pub page_number: Option<u32>,
    /// Items per page. Defaults to [`DEFAULT_PAGE_SIZE`], capped at
    /// [`MAX_PAGE_SIZE`].
    #[serde(default, rename = "page[size]")]
    pub page_size: Option<u32>,
}

impl PageOptions {
    /// Options for page `page_number` with `page_size` items per page.
    pub fn new(page_number: u32, page_size: u32) -> Self {
        Self {
            page_number: Some(page_number),
            page_size: Some(page_size),
        }
    }

    /// Effective page number, never zero.
    pub fn page(&self) -> u32 {
        self.page_number.filter(|n| *n > 0).unwrap_or(1)
    }

    /// Effective page size.
    pub fn size(&self) -> u32 {
        match self.page_size {
            None | Some(0) => DEFAULT_PAGE_SIZE,
            Some(n) => n.min(MAX_PAGE_SIZE),
        }
    }

    /// SQL `LIMIT`.
    pub fn limit(&self) -> i64 {
        i64::from(self.size())
    }

    /// SQL `OFFSET`.
    pub fn offset(&self) -> i64 {
        i64::from(self.page() - 1) * i64::from(self.size())
    }
}

/// Position of a page within the full result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// The page returned.
    pub current_page: u32,
    /// The page before, if any.
    pub prev_page: Option<u32>,
    /// The page after, if any.
    pub next_page: Option<u32>,
    /// Number of pages. An empty result still has one (empty) page.
    pub total_pages: u32,
    /// Number of items across all pages.
    pub total_count: i64,
}

impl Pagination {
    /// Describe the page selected by `opts` out of `total_count` items.
    pub fn new(opts: &PageOptions, total_count: i64) -> Self {
        let size = i64::from(opts.size());
        let total_pages = u32::try_from(((total_count.max(0) + size - 1) / size).max(1))
            .unwrap_or(u32::MAX);
        let current_page = opts.page();
        Self {
            current_page,
            prev_page: (current_page > 1).then(|| current_page - 1),
            next_page: (current_page < total_pages).then(|| current_page + 1),
            total_pages,
            total_count,
        }
    }
}
