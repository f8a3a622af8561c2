//! Registry of open device sessions, keyed by bus registry id.
//!
//! The registry is the single owner of every session it opens. It is an
//! ordinary value: create one per USB stack and pass it where needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::known_devices;
use crate::session::{DeviceSession, SessionConfig, SessionState};
use crate::usb::{DeviceError, RegistryId, Result, UsbTransport};

/// Shared handle onto a live session.
pub type SessionHandle<T> = Arc<Mutex<DeviceSession<T>>>;

/// Lock a session handle, recovering from a poisoned lock.
pub fn lock<T: UsbTransport>(handle: &SessionHandle<T>) -> MutexGuard<'_, DeviceSession<T>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Successful outcome of [`DeviceRegistry::resolve_device`].
pub enum Resolution<T: UsbTransport> {
    /// Brought up by this call.
    Opened(SessionHandle<T>),
    /// Already registered; nothing was touched on the bus.
    AlreadyOpen(SessionHandle<T>),
}

impl<T: UsbTransport> Resolution<T> {
    pub fn session(&self) -> &SessionHandle<T> {
        match self {
            Resolution::Opened(s) | Resolution::AlreadyOpen(s) => s,
        }
    }

    pub fn into_session(self) -> SessionHandle<T> {
        match self {
            Resolution::Opened(s) | Resolution::AlreadyOpen(s) => s,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Resolution::Opened(_))
    }
}

/// Per-device result of [`DeviceRegistry::discover_all`].
pub type Discovered<T> = Vec<(RegistryId, Result<SessionHandle<T>>)>;

pub struct DeviceRegistry<T: UsbTransport> {
    transport: Arc<T>,
    config: SessionConfig,
    sessions: HashMap<RegistryId, SessionHandle<T>>,
}

impl<T: UsbTransport> DeviceRegistry<T> {
    pub fn new(transport: Arc<T>, config: SessionConfig) -> Self {
        DeviceRegistry {
            transport,
            config,
            sessions: HashMap::new(),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Return the session for `id`, bringing the device up if needed.
    ///
    /// Devices missing from the known-device table are rejected with
    /// [`DeviceError::NotSupportedDevice`] before the device is opened.
    /// A registered session that was closed through its handle is dropped
    /// and the device is brought up again.
    pub fn resolve_device(&mut self, id: &RegistryId) -> Result<Resolution<T>> {
        if let Some(session) = self.sessions.get(id) {
            if lock(session).state() != SessionState::Closed {
                debug!("{id} already open");
                return Ok(Resolution::AlreadyOpen(Arc::clone(session)));
            }
            debug!("{id}: evicting closed session");
            self.sessions.remove(id);
        }

        let identity = self.transport.identify(id)?;
        if !known_devices::is_known_device(identity.vendor_id, identity.product_id) {
            debug!("{id}: {} is not an RTL2832U", identity.usb_id());
            return Err(DeviceError::NotSupportedDevice {
                vendor_id: identity.vendor_id,
                product_id: identity.product_id,
            });
        }

        let session = DeviceSession::open(Arc::clone(&self.transport), identity, self.config.clone())?;
        let handle = Arc::new(Mutex::new(session));
        self.sessions.insert(id.clone(), Arc::clone(&handle));
        Ok(Resolution::Opened(handle))
    }

    /// Resolve every attached device. Unsupported devices are left out.
    pub fn discover_all(&mut self) -> Result<Discovered<T>> {
        let mut found = Vec::new();
        for id in self.transport.list_devices()? {
            match self.resolve_device(&id) {
                Ok(r) => found.push((id, Ok(r.into_session()))),
                Err(e) if e.is_not_supported() => {}
                Err(e) => {
                    warn!("{id}: {e}");
                    found.push((id, Err(e)));
                }
            }
        }
        info!("Discovery: {} device(s), {} open", found.len(), self.sessions.len());
        Ok(found)
    }

    pub fn get(&self, id: &RegistryId) -> Option<SessionHandle<T>> {
        self.sessions.get(id).cloned()
    }

    /// Close and forget a session, e.g. after the device was unplugged.
    /// Returns whether `id` was registered.
    pub fn close(&mut self, id: &RegistryId) -> bool {
        match self.sessions.remove(id) {
            Some(handle) => {
                lock(&handle).close();
                debug!("{id} closed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<RegistryId> {
        let mut ids: Vec<_> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn shutdown(&mut self) {
        for (_, handle) in self.sessions.drain() {
            lock(&handle).close();
        }
    }
}

impl<T: UsbTransport> Drop for DeviceRegistry<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
