//! Base connection string handling
//!
//! One base string serves every shard; only the database path segment is
//! swapped. Query options (`retryWrites`, `w`, `authSource`, ...) pass
//! through verbatim.
//!
//! Single-host and `+srv` strings are plain URLs. A replica-set seed list
//! (`h1:27017,h2:27017`) is not a valid URL host, so it is cut out before
//! parsing and spliced back in when rendering.

use crate::error::{DriverError, DriverErrorKind, StoreResult};
use url::Url;

/// Stands in for a seed list while the rest of the string goes through [`Url`]
const SEED_LIST_HOST: &str = "seed-list.invalid";

/// Parsed base connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUri {
    url: Url,
    hosts: String,
    seed_list: bool,
}

impl ConnectionUri {
    /// Parse `scheme://[user[:pass]@]host[,host...][/database][?options]`
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let raw = raw.trim();
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid("missing '://' scheme separator"))?;

        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);
        let (userinfo, host_list) = match authority.rsplit_once('@') {
            Some((userinfo, hosts)) => (Some(userinfo), hosts),
            None => (None, authority),
        };

        let seed_list = host_list.contains(',');
        let url = if seed_list {
            if host_list.split(',').any(|h| h.trim().is_empty()) {
                return Err(invalid("empty host in seed list"));
            }
            let userinfo = userinfo.map(|u| format!("{}@", u)).unwrap_or_default();
            Url::parse(&format!("{}://{}{}{}", scheme, userinfo, SEED_LIST_HOST, tail))
        } else {
            Url::parse(raw)
        }
        .map_err(|e| invalid(format!("{} in '{}' connection string", e, scheme)))?;

        let hosts = if seed_list {
            host_list.to_string()
        } else {
            let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| invalid("missing host"))?;
            match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            }
        };

        Ok(Self { url, hosts, seed_list })
    }

    /// Database named in the base string, if any
    pub fn database(&self) -> Option<&str> {
        let path = self.url.path().trim_matches('/');
        (!path.is_empty()).then_some(path)
    }

    /// Query options, verbatim
    pub fn query(&self) -> Option<&str> {
        self.url.query().filter(|q| !q.is_empty())
    }

    /// Host list without credentials
    pub fn hosts(&self) -> &str {
        &self.hosts
    }

    /// Same URI pointed at `database` (replaces any existing path segment)
    pub fn with_database(&self, database: &str) -> Self {
        let mut next = self.clone();
        next.url.set_path(&format!("/{}", database));
        next
    }

    /// Full connection string
    pub fn to_uri_string(&self) -> String {
        self.render(&self.url)
    }

    /// Connection string with the password masked, for logs
    pub fn redacted(&self) -> String {
        let mut masked = self.url.clone();
        if masked.password().is_some() && masked.set_password(Some("***")).is_err() {
            return format!("{}://{}", masked.scheme(), self.hosts);
        }
        self.render(&masked)
    }

    fn render(&self, url: &Url) -> String {
        let out = url.to_string();
        if self.seed_list {
            out.replacen(SEED_LIST_HOST, &self.hosts, 1)
        } else {
            out
        }
    }
}

fn invalid(msg: impl Into<String>) -> DriverError {
    DriverError::new(DriverErrorKind::InvalidUri, msg)
}
