/*
 * Wire entities for the catalog request/response protocol.
 *
 * Messages are written with prost derive macros rather than protoc codegen;
 * field numbers are part of the catalog contract and must not be reassigned.
 */

pub mod entity;

pub use entity::*;
