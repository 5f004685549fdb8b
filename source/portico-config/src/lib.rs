pub mod cli;
pub mod internal;
pub mod loader;
pub mod raw;
pub mod rules;
pub mod url_parts;
