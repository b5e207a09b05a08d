//! Parlance is a chat orchestration engine for self-hosted and cloud LLM
//! backends.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns session state, the instruction library, prompt
//!   composition, dispatch routing, and the turn state machine that
//!   consumes token streams.
//! - [`probe`] tests reachability of inference endpoints and enumerates
//!   their models, without ever surfacing an error.
//! - [`server`] exposes the streaming chat endpoint over HTTP, re-framing
//!   either backend into one SSE contract.
//! - [`collab`] holds the trait seams for external collaborators: managed
//!   inference, web search, speech synthesis, and title generation.
//! - [`api`] defines the wire payloads shared by the router, the prober,
//!   and the HTTP surface.
//!
//! The runtime entrypoint lives in the binary crate (`src/main.rs`), which
//! initializes logging and dispatches into [`server`].

pub mod api;
pub mod collab;
pub mod core;
pub mod probe;
pub mod server;
pub mod utils;
