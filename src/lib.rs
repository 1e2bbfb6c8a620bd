//! # version-keeper
//!
//! Tracks which version of each deployed application is running, notices when
//! a newer artifact is published, and pins upgrades into a GitOps repository.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Resolvers  │──▶│  Reconciler  │──▶│    Store     │
//! │ OCI / Helm  │   │ latest_ver.  │   │ file/S3/mem  │
//! └─────────────┘   └──────┬───────┘   └──────┬───────┘
//!                          │ notify           │
//!                          ▼                  ▼
//!                   ┌──────────────┐   ┌──────────────┐
//!                   │   Notifier   │◀──│   Upgrade    │──▶ git push
//!                   │ log/webhook  │   │ YAML patches │
//!                   └──────────────┘   └──────────────┘
//!                          ▲
//!          ┌───────────────┼───────────────┐
//!     ┌──────────┐   ┌──────────┐   ┌──────────┐
//!     │   CLI    │   │   HTTP   │   │ Schedule │
//!     │  (vk)    │   │  (axum)  │   │  (watch) │
//!     └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vk init                          # create the catalog
//! vk add immich.json               # register a deployment
//! vk update all                    # look for new versions
//! vk upgrade immich.immich-server  # patch, commit and push
//! vk serve                         # HTTP API + periodic checks
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Deployment records and changes |
//! | [`keypath`] | Typed key paths into YAML documents |
//! | [`manifest`] | Applying one change to a manifest file |
//! | [`store`] | Deployment catalog backends |
//! | [`resolver`] | Registry and chart version resolvers |
//! | [`notify`] | Status message sinks |
//! | [`git`] | Git working-copy plumbing |
//! | [`upgrade`] | Upgrade engine |
//! | [`reconcile`] | Update reconciler |
//! | [`handlers`] | Guarded operations |
//! | [`commands`] | Text and JSON command parsing |
//! | [`server`] | HTTP server |
//! | [`schedule`] | Periodic reconciliation |

pub mod commands;
pub mod config;
pub mod git;
pub mod handlers;
pub mod keypath;
pub mod manifest;
pub mod models;
pub mod notify;
pub mod reconcile;
pub mod resolver;
pub mod schedule;
pub mod server;
pub mod store;
pub mod upgrade;
