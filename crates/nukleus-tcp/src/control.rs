//! The control-plane command conduit is an external collaborator (§6):
//! elsewhere in the runtime, ROUTE/UNROUTE commands arrive over their own
//! ring and are decoded into these types before reaching the worker. This
//! module only defines the command/response shapes and the route table they
//! populate; the command ring's wire encoding is out of scope here (it is
//! not one of the six stream frame types this crate owns).

use std::{collections::HashMap, net::SocketAddr};

use crate::{
    errors::RouteError,
    route::{Role, Route},
};

#[derive(Debug, Clone, Copy)]
pub struct RouteCommand {
    pub correlation_id: u64,
    pub role: Role,
    pub local_address: SocketAddr,
    pub remote_address: Option<SocketAddr>,
    pub authorization: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct UnrouteCommand {
    pub correlation_id: u64,
    pub route_id: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum ControlCommand {
    Route(RouteCommand),
    Unroute(UnrouteCommand),
}

#[derive(Debug, Clone, Copy)]
pub enum ControlResponse {
    Routed { correlation_id: u64, route_id: u64 },
    Unrouted { correlation_id: u64 },
    Rejected { correlation_id: u64 },
}

/// Live routes, keyed by `routeId`. Also tracks, per listening address, how
/// many server routes currently reference it, so an unroute only tears down
/// the listener once its last referencing route is gone (§3, Route
/// lifecycle).
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<u64, Route>,
    listener_refcount: HashMap<SocketAddr, usize>,
    next_route_id: u64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self { routes: HashMap::new(), listener_refcount: HashMap::new(), next_route_id: 1 }
    }

    pub fn insert(&mut self, cmd: &RouteCommand) -> u64 {
        let route_id = self.next_route_id;
        self.next_route_id += 1;
        if cmd.role == Role::Server {
            *self.listener_refcount.entry(cmd.local_address).or_insert(0) += 1;
        }
        self.routes.insert(
            route_id,
            Route {
                route_id,
                role: cmd.role,
                local_address: cmd.local_address,
                remote_address: cmd.remote_address,
            },
        );
        route_id
    }

    /// Removes the route. Returns `Some(addr)` with the listener address if
    /// this was the last server route bound to it (the caller must unbind
    /// the listener).
    pub fn remove(&mut self, route_id: u64) -> Result<Option<SocketAddr>, RouteError> {
        let route = self.routes.remove(&route_id).ok_or(RouteError::NotFound(route_id))?;
        if route.role != Role::Server {
            return Ok(None);
        }
        let Some(count) = self.listener_refcount.get_mut(&route.local_address) else {
            return Ok(None);
        };
        *count -= 1;
        if *count == 0 {
            self.listener_refcount.remove(&route.local_address);
            Ok(Some(route.local_address))
        } else {
            Ok(None)
        }
    }

    pub fn get(&self, route_id: u64) -> Option<&Route> {
        self.routes.get(&route_id)
    }

    /// Server routes bound to `addr`, most specific remote-address filter
    /// considered in insertion order (first match wins).
    pub fn server_routes_at(&self, addr: SocketAddr) -> impl Iterator<Item = &Route> {
        self.routes
            .values()
            .filter(move |r| r.role == Role::Server && r.local_address == addr)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_cmd(addr: &str) -> RouteCommand {
        RouteCommand {
            correlation_id: 1,
            role: Role::Server,
            local_address: addr.parse().unwrap(),
            remote_address: None,
            authorization: 0,
        }
    }

    #[test]
    fn unroute_tears_down_listener_only_when_last_reference_drops() {
        let mut table = RouteTable::new();
        let a = table.insert(&server_cmd("127.0.0.1:9000"));
        let b = table.insert(&server_cmd("127.0.0.1:9000"));

        assert_eq!(table.remove(a).unwrap(), None, "listener still referenced by route b");
        assert_eq!(
            table.remove(b).unwrap(),
            Some("127.0.0.1:9000".parse().unwrap()),
            "last reference should report the listener to unbind"
        );
    }

    #[test]
    fn unroute_unknown_route_errors() {
        let mut table = RouteTable::new();
        assert!(matches!(table.remove(42), Err(RouteError::NotFound(42))));
    }
}
