use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Channel, ChannelState};
use crate::error::PlexusError;

/// Name to channel map shared by the whole runtime.
///
/// The registry lock is never held while a thread waits on a channel lock:
/// channels are only ever try-locked under it, and a contended lookup waits
/// on the channel's `usable` condition, which releases the registry.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, channel: Channel) -> Result<Arc<Channel>, PlexusError> {
        let mut channels = self.channels.lock();
        if channels.contains_key(channel.name()) {
            return Err(PlexusError::NameConflict {
                name: channel.name().to_string(),
            });
        }
        let channel = Arc::new(channel);
        channels.insert(channel.name().to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Unregister a channel and wake every thread waiting to lock it.
    pub(crate) fn remove(&self, name: &str) -> Option<Arc<Channel>> {
        let mut channels = self.channels.lock();
        let channel = channels.remove(name)?;
        channel.usable.notify_all();
        Some(channel)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Run `f` with the named channel locked.
    ///
    /// `carry` is handed to `f`, or returned with the error when the channel
    /// does not exist, so owned values such as a process survive a failed lookup.
    pub(crate) fn with_channel<T, R>(
        &self,
        name: &str,
        carry: T,
        f: impl FnOnce(&Arc<Channel>, &mut ChannelState, T) -> R,
    ) -> Result<R, (T, PlexusError)> {
        let mut channels = self.channels.lock();
        loop {
            let channel = match channels.get(name) {
                Some(channel) => Arc::clone(channel),
                None => {
                    return Err((
                        carry,
                        PlexusError::ChannelNotFound {
                            name: name.to_string(),
                        },
                    ))
                }
            };

            if let Some(mut state) = channel.state.try_lock() {
                drop(channels);
                let result = f(&channel, &mut state, carry);

                // Release under the registry lock so a waiter cannot miss the signal.
                let channels = self.channels.lock();
                drop(state);
                channel.usable.notify_one();
                drop(channels);
                return Ok(result);
            }

            channel.usable.wait(&mut channels);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ChannelKind;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_insert_rejects_duplicate_name() {
        let registry = ChannelRegistry::new();
        registry.insert(Channel::new("c", ChannelKind::Sync, None)).unwrap();
        let err = registry.insert(Channel::new("c", ChannelKind::Async, None)).unwrap_err();
        assert_eq!(err.to_string(), "channel 'c' already exists");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_missing_channel_returns_carry() {
        let registry = ChannelRegistry::new();
        let (carry, err) = registry.with_channel("nope", 7, |_, _, n| n).unwrap_err();
        assert_eq!(carry, 7);
        assert!(matches!(err, PlexusError::ChannelNotFound { .. }));
    }

    #[test]
    fn test_contended_lookup_waits_for_release() {
        let registry = Arc::new(ChannelRegistry::new());
        registry.insert(Channel::new("c", ChannelKind::Sync, None)).unwrap();

        let holder = Arc::clone(&registry);
        let (locked_tx, locked_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            holder
                .with_channel("c", (), |_, _, ()| {
                    locked_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(50));
                })
                .is_ok()
        });
        locked_rx.recv().unwrap();
        let seen = registry.with_channel("c", (), |channel, _, ()| channel.name().to_string());
        assert_eq!(seen.ok().as_deref(), Some("c"));
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_waiter_sees_removal() {
        let registry = Arc::new(ChannelRegistry::new());
        registry.insert(Channel::new("c", ChannelKind::Sync, None)).unwrap();

        let remover = Arc::clone(&registry);
        let (locked_tx, locked_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            remover
                .with_channel("c", (), |channel, _, ()| {
                    locked_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(50));
                    remover.remove(channel.name()).is_some()
                })
                .unwrap_or(false)
        });
        locked_rx.recv().unwrap();
        let result = registry.with_channel("c", (), |_, _, ()| ());
        assert!(matches!(result, Err(((), PlexusError::ChannelNotFound { .. }))));
        assert!(handle.join().unwrap());
    }
}
