//! Model artifacts for the local engine: the fixed catalog of weights the
//! image workflows need, and the download manager that fetches them.

pub mod catalog;
pub mod downloader;
