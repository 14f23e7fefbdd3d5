//! Process-wide singleton handler for manifest-driven clients.
//!
//! Small programs declare their channels in a static manifest slice
//! and never touch the [`NetHandler`] directly: configure, create
//! channels by name, tear down at exit. Init-once semantics, double
//! init is an error, teardown is explicit and idempotent.

use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::{
    ChannelAttrs, Config, Error, NetHandler, Result, RxChannel, TxChannel, attrs::attrs_by_name,
};

static CONFIG: Lazy<Mutex<Config>> = Lazy::new(|| Mutex::new(Config::default()));
static HANDLER: Lazy<Mutex<Option<NetHandler>>> = Lazy::new(|| Mutex::new(None));

/// Adjust the configuration the singleton will be created with.
/// Applied on the next [`init`]; no effect on a live handler.
pub fn configure(f: impl FnOnce(&mut Config)) {
    let mut cfg = CONFIG.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    f(&mut cfg);
}

/// Bring the singleton up with the stored configuration. Fails with
/// [`Error::AlreadyInitialized`] when it already runs.
pub fn init() -> Result<()> {
    let mut slot = HANDLER.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if slot.is_some() {
        return Err(Error::AlreadyInitialized);
    }
    let cfg = CONFIG.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
    *slot = Some(NetHandler::create(&cfg)?);
    Ok(())
}

/// Tear the singleton down. Channels created from it observe
/// [`Error::ShuttingDown`] afterwards. Idempotent.
pub fn destroy() {
    let mut slot = HANDLER.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    *slot = None;
}

fn with_handler<T>(f: impl FnOnce(&NetHandler) -> Result<T>) -> Result<T> {
    // Create on first use so NETCHAN_TX/RX-style flows need no
    // explicit init call.
    {
        let slot = HANDLER.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handler) = slot.as_ref() {
            return f(handler);
        }
    }
    match init() {
        // Lost a race with another first use; the handler is up.
        Ok(()) | Err(Error::AlreadyInitialized) => {}
        Err(err) => return Err(err),
    }
    let slot = HANDLER.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    slot.as_ref().map_or(Err(Error::ShuttingDown), f)
}

fn lookup(name: &str, manifest: &[ChannelAttrs]) -> Result<ChannelAttrs> {
    attrs_by_name(name, manifest)
        .copied()
        .ok_or_else(|| Error::InvalidAttribute(format!("no channel '{name}' in manifest")))
}

/// Create a Tx channel by manifest name on the singleton handler.
pub fn create_tx(name: &str, manifest: &[ChannelAttrs]) -> Result<TxChannel> {
    let attrs = lookup(name, manifest)?;
    with_handler(|nh| nh.create_tx(&attrs))
}

/// Create an Rx channel by manifest name on the singleton handler.
pub fn create_rx(name: &str, manifest: &[ChannelAttrs]) -> Result<RxChannel> {
    let attrs = lookup(name, manifest)?;
    with_handler(|nh| nh.create_rx(&attrs))
}
