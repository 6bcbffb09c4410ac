//! Recent-failure memory for route selection.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::collab::Proxy;
use crate::config::ConnectionSpec;
use crate::route::Route;

type Key = (Proxy, SocketAddr, ConnectionSpec);

/// Remembers routes that failed recently so the planner tries fresher ones
/// first. A later success on the same route clears the entry.
#[derive(Debug, Default)]
pub(crate) struct RouteDatabase {
    failed: Mutex<HashSet<Key>>,
}

impl RouteDatabase {
    pub(crate) fn failed(&self, route: &Route) {
        self.failed.lock().unwrap().insert(key(route));
    }

    pub(crate) fn succeeded(&self, route: &Route) {
        self.failed.lock().unwrap().remove(&key(route));
    }

    pub(crate) fn is_recently_failed(&self, route: &Route) -> bool {
        self.failed.lock().unwrap().contains(&key(route))
    }
}

fn key(route: &Route) -> Key {
    (route.proxy.clone(), route.socket_addr, route.spec)
}
