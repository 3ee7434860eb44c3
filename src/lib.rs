//! # Ask Harness
//!
//! Question routing and retrieval for a community chat assistant.
//!
//! Every incoming chat message passes through a per-user rate limiter, an
//! optional question filter (for passively monitored channels), and an
//! intent router. Questions about a named project, chapter, or event are
//! answered deterministically from structured entity fields; everything else
//! goes to a retrieval-augmented generator that answers only from retrieved
//! context, or abstains.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐   ┌────────────┐   ┌──────────┐   ┌───────────────┐
//!  │   Chat   │──▶│ Rate limit │──▶│  Router  │──▶│ Static lookup │──▶ envelope
//!  │ (HTTP/CLI)│  │  + filter  │   │ (cached) │   └──────┬────────┘
//!  └──────────┘   └─────┬──────┘   └────┬─────┘          │ miss
//!                       │               │ DYNAMIC        ▼
//!                  ┌────▼────┐          └──────────▶┌─────────┐
//!                  │  Cache  │                      │   RAG   │──▶ envelope
//!                  │redis/mem│                      │ (SQLite)│
//!                  └─────────┘                      └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! askh init                              # create database
//! askh load ./fixtures/sample.json       # seed entities and chunks
//! askh ask "who leads project alpha?"    # run one question
//! askh serve                             # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`cache`] | Fail-open cache facade (redis or in-memory) |
//! | [`rate_limit`] | Fixed-window per-user rate limiter |
//! | [`router`] | STATIC/DYNAMIC intent router |
//! | [`detector`] | Passive question filter |
//! | [`lookup`] | Deterministic answers from entity fields |
//! | [`store`] | Entity and chunk store traits, in-memory store |
//! | [`sqlite_store`] | SQLite-backed store |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generator`] | Chat-completion provider abstraction |
//! | [`rag`] | Grounded retrieval-augmented answers |
//! | [`pipeline`] | Request orchestration |
//! | [`server`] | HTTP server |
//! | [`seed`] | Development fixtures loader |
//! | [`text`] | Output escaping and truncation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod config;
pub mod db;
pub mod detector;
pub mod embedding;
pub mod generator;
pub mod lookup;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod rag;
pub mod rate_limit;
pub mod router;
pub mod seed;
pub mod server;
pub mod sqlite_store;
pub mod store;
pub mod text;
