//! Orca: an orchestrator that drives a fleet of long-running AI coding-agent
//! subprocesses against a backlog of engineering tasks synchronized from an
//! external issue tracker.
//!
//! `domain` holds the core entities and ports (the hexagon); `adapters`
//! implements those ports against SQLite, the tracker's HTTP API, `git`,
//! and the agent CLI; `services` is the Scheduler/Runner/SyncEngine/
//! Monitors/Supervisor that drive the orchestration loop described in the
//! system design; `api` is the HTTP/SSE surface a dashboard consumes; `cli`
//! is the `orca` binary's subcommands.

pub mod adapters;
pub mod api;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;
