use crate::{rsip_ext::via_branch, Error, Result};
use rsip::{prelude::HeadersExt, Method, Request};
use std::{
    fmt,
    hash::{Hash, Hasher},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

impl fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionRole::Client => write!(f, "c"),
            TransactionRole::Server => write!(f, "s"),
        }
    }
}

/// Identifies one transaction: role, top Via branch and method (RFC 3261 17.1.3/17.2.3).
///
/// ACK and CANCEL map onto their own method; matching an ACK to its INVITE
/// server transaction is the transaction layer's business.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionKey {
    pub role: TransactionRole,
    pub branch: String,
    pub method: Method,
}

impl TransactionKey {
    pub fn new(role: TransactionRole, branch: impl Into<String>, method: Method) -> Self {
        Self {
            role,
            branch: branch.into(),
            method,
        }
    }

    pub fn from_request(request: &Request, role: TransactionRole) -> Result<Self> {
        let via = request.via_header()?;
        let branch = via_branch(via)
            .ok_or_else(|| Error::Error("via branch not found".to_string()))?;
        Ok(Self::new(role, branch, request.method.clone()))
    }
}

impl Hash for TransactionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.branch.hash(state);
        self.method.to_string().hash(state);
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}_{}", self.role, self.method, self.branch)
    }
}
