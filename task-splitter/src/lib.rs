// Persistence layer
pub mod database;

// Decomposition service client and parsing
pub mod decompose;

// Durable workflow engine
pub mod engine;

// Task operations
pub mod tasks;

// Profile management
pub mod users;

// Optimistic client cache
pub mod cache;
