//! Document lifecycle: registration, processing runs and the background
//! worker that picks up pending documents.

mod crud;
mod processing;
mod workers;
