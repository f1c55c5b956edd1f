use std::{
    env,
    net::{IpAddr, Ipv4Addr, UdpSocket},
    path::PathBuf,
};

use anyhow::{anyhow, Context, Result};

/// Name of the environment variable injected into every launched command
/// with this executor's container-network IP.
pub const CONTAINER_IP_ENV: &str = "MESOS_CONTAINER_IP";

/// Process configuration assembled from the environment and command line.
/// All fields are immutable for the lifetime of the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub framework_id: String,
    pub executor_id: String,
    /// Full agent API URL: `<scheme>://<host>:<port>/<agent-id>/api/v1`.
    pub agent_api_url: String,
    /// `host:port` of the agent, used for connection probes.
    pub agent_authority: String,
    pub sandbox_dir: PathBuf,
    pub launcher_dir: PathBuf,
    /// Complete `Authorization` header value, when a credential was supplied.
    pub auth_header: Option<String>,
    /// This executor's own container-network IP.
    pub container_ip: IpAddr,
}

impl ExecutorConfig {
    pub fn from_env(launcher_dir: PathBuf) -> Result<Self> {
        let framework_id = required_env("MESOS_FRAMEWORK_ID")?;
        let executor_id = required_env("MESOS_EXECUTOR_ID")?;
        let agent_pid = required_env("MESOS_SLAVE_PID")?;
        let sandbox_dir = PathBuf::from(required_env("MESOS_SANDBOX")?);

        let upid = Upid::parse(&agent_pid)
            .with_context(|| format!("failed to parse MESOS_SLAVE_PID '{agent_pid}'"))?;

        let scheme = if ssl_enabled() { "https" } else { "http" };
        let agent_authority = format!("{}:{}", upid.host, upid.port);
        let agent_api_url = format!("{scheme}://{agent_authority}/{}/api/v1", upid.id);

        let auth_header = env::var("MESOS_EXECUTOR_AUTHENTICATION_TOKEN")
            .ok()
            .map(|token| format!("Bearer {token}"));

        let container_ip = discover_container_ip(&agent_authority);

        Ok(ExecutorConfig {
            framework_id,
            executor_id,
            agent_api_url,
            agent_authority,
            sandbox_dir,
            launcher_dir,
            auth_header,
            container_ip,
        })
    }
}

fn required_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| anyhow!("expecting '{name}' to be set in the environment"))
}

fn ssl_enabled() -> bool {
    let value = env::var("SSL_ENABLED")
        .or_else(|_| env::var("LIBPROCESS_SSL_ENABLED"))
        .unwrap_or_default();
    value == "1" || value == "true"
}

/// Address of the node agent, of the form `id@host:port`.
struct Upid {
    id: String,
    host: String,
    port: u16,
}

impl Upid {
    fn parse(value: &str) -> Result<Self> {
        let (id, address) = value
            .split_once('@')
            .ok_or_else(|| anyhow!("missing '@' separator"))?;
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing ':' port separator"))?;
        if id.is_empty() || host.is_empty() {
            return Err(anyhow!("empty agent id or host"));
        }
        let port: u16 = port.parse().context("invalid port")?;
        Ok(Upid {
            id: id.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

/// Determines the IP address to advertise to launched tasks. An explicit
/// override wins; otherwise the routing decision toward the agent tells us
/// which local address this container network uses.
fn discover_container_ip(agent_authority: &str) -> IpAddr {
    for var in ["LIBPROCESS_ADVERTISE_IP", "LIBPROCESS_IP"] {
        if let Ok(value) = env::var(var) {
            if let Ok(ip) = value.parse() {
                return ip;
            }
        }
    }

    if let Ok(socket) = UdpSocket::bind(("0.0.0.0", 0)) {
        if socket.connect(agent_authority).is_ok() {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip();
            }
        }
    }

    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upid_parses_host_and_port() {
        let upid = Upid::parse("slave(1)@10.0.0.5:5051").unwrap();
        assert_eq!(upid.id, "slave(1)");
        assert_eq!(upid.host, "10.0.0.5");
        assert_eq!(upid.port, 5051);
    }

    #[test]
    fn upid_rejects_malformed_values() {
        assert!(Upid::parse("no-separator").is_err());
        assert!(Upid::parse("id@host").is_err());
        assert!(Upid::parse("id@host:not-a-port").is_err());
        assert!(Upid::parse("@host:1").is_err());
    }
}
