use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub route_id: u64,
    pub role: Role,
    pub local_address: SocketAddr,
    pub remote_address: Option<SocketAddr>,
}

impl Route {
    /// Whether an accepted connection's remote peer address is allowed by
    /// this route's optional filter.
    pub fn accepts_remote(&self, remote: SocketAddr) -> bool {
        match self.remote_address {
            Some(filter) => filter.ip() == remote.ip(),
            None => true,
        }
    }
}
