//! The watcher: seeds the address cache from a full kernel dump, then
//! listens for address-change notifications and fans each qualifying
//! addition out to the configured hooks with retry/backoff.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::cache::AddrCache;
use crate::config::{self, WatchConfig};
use crate::filter::{self, FilterExpr};
use crate::hook::{parse_hook, EchoHook, Hook};
use crate::netlink::{
    self, NetlinkChannel, RawAddrMessage, GROUP_IPV4_IFADDR, GROUP_IPV6_IFADDR,
};
use crate::types::{AddressEvent, InterfaceRef, Result, WatchError};

/// Addresses younger than this at seeding time are treated as genuinely new
/// assignments that raced with startup, and still fire hooks.
const FRESHNESS_THRESHOLD_SECS: u64 = 30;

pub struct Watcher {
    cache: AddrCache,
    filters: Vec<FilterExpr>,
    hooks: Vec<Arc<dyn Hook>>,
    /// Resolved allowlist (index -> name); empty means watch all interfaces.
    watched: HashMap<u32, String>,
    max_retries: u32,
    groups: u32,
    /// Serializes framed hook output on stdout.
    console: Arc<Mutex<()>>,
}

impl Watcher {
    pub fn new(config: WatchConfig) -> Result<Self> {
        let extra_env = match &config.env_file {
            Some(path) => config::load_env_file(path)?,
            None => Vec::new(),
        };
        let mut hooks: Vec<Arc<dyn Hook>> = Vec::new();
        for spec in &config.hooks {
            hooks.push(parse_hook(spec, &extra_env)?);
        }
        Self::with_hooks(config, hooks)
    }

    /// Builds a watcher around pre-constructed hooks. `Watcher::new` is the
    /// normal entry point; this one lets tests inject instrumented hooks.
    pub fn with_hooks(config: WatchConfig, mut hooks: Vec<Arc<dyn Hook>>) -> Result<Self> {
        config::validate_config(&config)?;

        // Flag-derived filters are just additional entries in the filter set.
        let mut filter_strings = config.filters.clone();
        if config.ipv4_only {
            filter_strings.push("Is4".to_string());
        }
        if config.ipv6_only {
            filter_strings.push("Is6".to_string());
        }
        let filters = filter::parse_filters(&filter_strings)?;

        if hooks.is_empty() {
            hooks.push(Arc::new(EchoHook));
        }

        let mut watched = HashMap::new();
        for name in &config.interfaces {
            let index = nix::net::if_::if_nametoindex(name.as_str()).map_err(|e| {
                WatchError::Config(format!("unknown interface {}: {}", name, e))
            })?;
            watched.insert(index, name.clone());
        }

        let groups = if config.ipv4_only {
            GROUP_IPV4_IFADDR
        } else if config.ipv6_only {
            GROUP_IPV6_IFADDR
        } else {
            GROUP_IPV4_IFADDR | GROUP_IPV6_IFADDR
        };

        Ok(Self {
            cache: AddrCache::new(),
            filters,
            hooks,
            watched,
            max_retries: config.max_retries,
            groups,
            console: Arc::new(Mutex::new(())),
        })
    }

    pub fn cache(&self) -> &AddrCache {
        &self.cache
    }

    /// Runs the watcher: seed, signal readiness, then listen. Blocks for the
    /// life of the process; only a failed dial or seeding error returns.
    pub async fn watch(&self) -> Result<()> {
        self.seed().await?;

        match notify_ready() {
            Ok(true) => tracing::debug!("notified service manager of readiness"),
            Ok(false) => tracing::debug!("no service manager notify socket"),
            Err(e) => tracing::warn!("readiness notification failed: {}", e),
        }

        if self.watched.is_empty() {
            tracing::info!("listening for IP address changes on all interfaces");
        } else {
            let names: Vec<&str> = self.watched.values().map(String::as_str).collect();
            tracing::info!(
                "listening for IP address changes on {}",
                names.join(", ")
            );
        }

        let mut channel = NetlinkChannel::dial(self.groups)?;
        loop {
            // Per-receive failures are logged and the loop continues; only
            // the dial above is fatal.
            let messages = match channel.recv().await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!("netlink receive failed: {}", e);
                    continue;
                }
            };
            for msg in &messages {
                if let Err(e) = self.handle_message(msg, false).await {
                    tracing::warn!("skipping message: {}", e);
                }
            }
        }
    }

    /// Populates the cache from a full address dump. Hooks stay quiet for
    /// pre-existing addresses; only addresses assigned within the freshness
    /// threshold fire, since those raced with our startup.
    async fn seed(&self) -> Result<()> {
        tracing::info!("caching initial addresses");
        let mut channel = NetlinkChannel::dial(0)?;
        let messages = channel.execute_dump().await?;
        for msg in &messages {
            if let Err(e) = self.handle_message(msg, true).await {
                tracing::warn!("skipping dump message: {}", e);
            }
        }
        Ok(())
    }

    async fn handle_message(&self, msg: &RawAddrMessage, startup: bool) -> Result<()> {
        let Some(event) = netlink::decode(msg, netlink::boottime_secs())? else {
            return Ok(());
        };
        self.handle_event(&event, startup).await;
        Ok(())
    }

    /// Applies one decoded event: cache bookkeeping for deletions, and the
    /// new-address pipeline (allowlist, cache, filters, dispatch) for
    /// additions. `startup` suppresses hooks for non-fresh addresses.
    pub async fn handle_event(&self, event: &AddressEvent, startup: bool) {
        if !self.interface_watched(event) {
            tracing::debug!(if_index = event.if_index, "interface not watched, skipping");
            return;
        }

        if event.is_deletion {
            tracing::debug!(%event.address, "address withdrawn, dropping from cache");
            self.cache.remove(event.if_index, event.address);
            return;
        }

        if self.cache.has(event.if_index, event.address) {
            tracing::debug!(%event.address, "address already cached, skipping hooks");
            return;
        }

        // A filtered-out address is deliberately not cached, so a later
        // change to it gets re-evaluated instead of being remembered as seen.
        if !filter::passes(event.address, &self.filters) {
            tracing::debug!(%event.address, "address does not pass filters, skipping hooks");
            return;
        }

        tracing::info!(%event.address, if_index = event.if_index, "caching new address");
        self.cache.insert(event.if_index, event.address);

        if startup {
            let fresh = event
                .age_secs
                .is_some_and(|age| age < FRESHNESS_THRESHOLD_SECS);
            if !fresh {
                tracing::debug!(%event.address, "pre-existing address at startup, skipping hooks");
                return;
            }
            tracing::info!(%event.address, "fresh address during startup, running hooks");
        }

        self.dispatch(event).await;
    }

    /// Runs every hook concurrently for this event and waits for all of them
    /// to reach a terminal outcome before returning.
    async fn dispatch(&self, event: &AddressEvent) {
        let iface = self.interface_ref(event);
        let mut tasks = Vec::with_capacity(self.hooks.len());
        for hook in &self.hooks {
            let hook = Arc::clone(hook);
            let iface = iface.clone();
            let console = Arc::clone(&self.console);
            let max_retries = self.max_retries;
            let address = event.address;
            tasks.push(tokio::spawn(async move {
                run_with_retries(hook, iface, address, max_retries, console).await;
            }));
        }
        for result in join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!("hook task panicked: {}", e);
            }
        }
    }

    fn interface_watched(&self, event: &AddressEvent) -> bool {
        if self.watched.is_empty() || self.watched.contains_key(&event.if_index) {
            return true;
        }
        // The kernel label can match a configured name before (or instead
        // of) index resolution, e.g. for aliased IPv4 interfaces.
        event
            .label
            .as_deref()
            .is_some_and(|label| self.watched.values().any(|name| name == label))
    }

    fn interface_ref(&self, event: &AddressEvent) -> InterfaceRef {
        let name = self
            .watched
            .get(&event.if_index)
            .cloned()
            .or_else(|| event.label.clone())
            .or_else(|| netlink::if_indextoname(event.if_index));
        InterfaceRef {
            index: event.if_index,
            name,
        }
    }
}

/// One hook's full retry loop. Attempt `i` that fails waits `2^i` seconds
/// before the next attempt; the final failure is terminal and unslept.
async fn run_with_retries(
    hook: Arc<dyn Hook>,
    iface: InterfaceRef,
    addr: IpAddr,
    max_attempts: u32,
    console: Arc<Mutex<()>>,
) {
    for attempt in 1..=max_attempts {
        match hook.run(&iface, addr).await {
            Ok(output) => {
                let mut lines = vec![format!("Hook {} succeeded", hook.name())];
                if !output.is_empty() {
                    lines.push(output);
                }
                print_framed(&console, &lines).await;
                return;
            }
            Err(err) => {
                let backoff = Duration::from_secs(2u64.saturating_pow(attempt));
                let mut lines = vec![format!("Error running hook {}", hook.name())];
                if !err.output.is_empty() {
                    lines.push(err.output);
                }
                lines.push(err.reason);
                if attempt < max_attempts {
                    lines.push(format!("Retrying in {}s", backoff.as_secs()));
                } else {
                    lines.push("Max attempts reached".to_string());
                }
                print_framed(&console, &lines).await;
                if attempt < max_attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

/// Frames a hook outcome between separator lines on stdout. Hook tasks for
/// one event run concurrently, so the console guard keeps frames whole.
async fn print_framed(console: &Mutex<()>, lines: &[String]) {
    let separator = "=".repeat(80);
    let _guard = console.lock().await;
    println!("{}", separator);
    for line in lines {
        println!("{}", line);
    }
    println!("{}", separator);
}

/// Tells the service manager we are ready, if a notify socket is set.
/// Returns Ok(false) when there is nothing to notify.
fn notify_ready() -> std::io::Result<bool> {
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::net::UnixDatagram;

    let Some(path) = std::env::var_os("NOTIFY_SOCKET") else {
        return Ok(false);
    };

    let socket = UnixDatagram::unbound()?;
    let bytes = path.as_os_str().as_bytes();
    if let Some(name) = bytes.strip_prefix(b"@") {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
        socket.send_to_addr(b"READY=1", &addr)?;
    } else {
        socket.send_to(b"READY=1", std::path::Path::new(&path))?;
    }
    Ok(true)
}
