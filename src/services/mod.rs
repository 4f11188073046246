pub mod accounting;
pub mod background;
pub mod content_fetcher;
pub mod object_store;
pub mod response_cache;
pub mod storage_service;
