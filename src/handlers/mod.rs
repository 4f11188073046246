pub mod content_handlers;
