/// Module for creating empty files and directories
pub(crate) mod create;

/// Module for single and recursive deletes
pub(crate) mod delete;

/// Module for reading remote files
pub(crate) mod fetch;

/// Module for listing remote directory contents
pub(crate) mod list;

/// Module for the three-tier rename
pub(crate) mod rename;
