//! Custom Resource Definitions for the Bookstore controller

mod bookstore;

pub use bookstore::{Bookstore, BookstoreSpec, BookstoreStatus, DEFAULT_SECRET_NAME};
