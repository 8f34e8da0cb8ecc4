use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::tunnel::{random_hex, Tunnel};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The "already in use" substring is part of the wire contract: clients
    /// classify the handshake error by it.
    #[error("subdomain {0:?} is already in use")]
    Conflict(String),
}

enum Slot {
    /// Label claimed by a handshake still in flight.
    Reserved,
    Live(Tunnel),
}

/// Concurrent map from subdomain label to live tunnel. Labels are opaque
/// strings here; the dispatcher decides what counts as a label.
#[derive(Default)]
pub struct Registry {
    tunnels: RwLock<HashMap<String, Slot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a label for a new tunnel, synthesizing a random one when the
    /// request is empty. The uniqueness check and the insert run under one
    /// write guard, so of two racing registrations for the same label
    /// exactly one wins.
    ///
    /// The claim is invisible to `lookup` until `bind` attaches the live
    /// session; callers must `unregister` on every failure path in between.
    pub async fn register(&self, requested: &str) -> Result<String, RegistryError> {
        let mut tunnels = self.tunnels.write().await;
        let label = if requested.is_empty() {
            loop {
                let candidate = random_hex(4);
                if !tunnels.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            if tunnels.contains_key(requested) {
                return Err(RegistryError::Conflict(requested.to_string()));
            }
            requested.to_string()
        };
        tunnels.insert(label.clone(), Slot::Reserved);
        Ok(label)
    }

    /// Attaches the live session record to a label claimed by `register`.
    pub async fn bind(&self, label: &str, tunnel: Tunnel) {
        self.tunnels
            .write()
            .await
            .insert(label.to_string(), Slot::Live(tunnel));
    }

    /// Snapshot read. Returns a handle the dispatcher can open streams on.
    pub async fn lookup(&self, label: &str) -> Option<Tunnel> {
        match self.tunnels.read().await.get(label) {
            Some(Slot::Live(tunnel)) => Some(tunnel.clone()),
            _ => None,
        }
    }

    /// Idempotent removal.
    pub async fn unregister(&self, label: &str) {
        if self.tunnels.write().await.remove(label).is_some() {
            debug!(subdomain = %label, "registry entry removed");
        }
    }

    /// Closes every live session. The per-tunnel tasks observe the close
    /// and unregister themselves.
    pub async fn close_all(&self) {
        let controls: Vec<_> = self
            .tunnels
            .read()
            .await
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(tunnel) => Some(tunnel.control.clone()),
                Slot::Reserved => None,
            })
            .collect();
        for mut control in controls {
            let _ = control.close().await;
        }
    }
}
