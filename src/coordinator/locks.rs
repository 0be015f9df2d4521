use crate::prelude::*;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One mutex per power channel. Initialization holds both channels of its
/// unit; a switch or insulation measurement holds its own channel.
#[derive(Clone, Default)]
pub struct ChannelLocks {
    locks: Arc<HashMap<ChannelAddress, Arc<Mutex<()>>>>,
}

/// Releases the channel when dropped.
pub struct ChannelGuard {
    addr: ChannelAddress,
    _guard: OwnedMutexGuard<()>,
}

impl ChannelGuard {
    pub fn addr(&self) -> &ChannelAddress {
        &self.addr
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        trace!("released {}", self.addr);
    }
}

impl ChannelLocks {
    pub fn new(addrs: impl IntoIterator<Item = ChannelAddress>) -> Self {
        Self {
            locks: Arc::new(
                addrs
                    .into_iter()
                    .map(|addr| (addr, Arc::new(Mutex::new(()))))
                    .collect(),
            ),
        }
    }

    /// `None` if the channel is unknown or stays held for longer than `wait`.
    pub async fn acquire(&self, addr: &ChannelAddress, wait: Duration) -> Option<ChannelGuard> {
        let lock = self.locks.get(addr)?.clone();

        match tokio::time::timeout(wait, lock.lock_owned()).await {
            Ok(guard) => {
                trace!("acquired {}", addr);
                Some(ChannelGuard {
                    addr: addr.clone(),
                    _guard: guard,
                })
            }
            Err(_) => {
                debug!("{} still held after {:?}", addr, wait);
                None
            }
        }
    }

    /// Both channels of a unit, first then second. Nothing is held on failure.
    pub async fn acquire_unit(&self, unit: &UnitAddress, wait: Duration) -> Option<[ChannelGuard; 2]> {
        let [first, second] = ChannelAddress::both(unit);

        let first = self.acquire(&first, wait).await?;
        let second = self.acquire(&second, wait).await?;

        Some([first, second])
    }

    pub fn is_locked(&self, addr: &ChannelAddress) -> bool {
        self.locks
            .get(addr)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> ChannelAddress {
        ChannelAddress::from_str(s).unwrap()
    }

    fn locks() -> ChannelLocks {
        ChannelLocks::new(ChannelAddress::both(&UnitAddress::from_str("m1").unwrap()))
    }

    #[tokio::test]
    async fn exclusive_until_dropped() {
        let locks = locks();
        let wait = Duration::from_millis(20);

        let guard = locks.acquire(&addr("ch:m1:1"), wait).await.unwrap();
        assert!(locks.is_locked(&addr("ch:m1:1")));
        assert!(locks.acquire(&addr("ch:m1:1"), wait).await.is_none());
        assert!(locks.acquire(&addr("ch:m1:2"), wait).await.is_some());

        drop(guard);
        assert!(!locks.is_locked(&addr("ch:m1:1")));
        assert!(locks.acquire(&addr("ch:m1:1"), wait).await.is_some());
    }

    #[tokio::test]
    async fn unknown_channel() {
        assert!(locks()
            .acquire(&addr("ch:m7:1"), Duration::from_millis(1))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn unit_lock_releases_first_on_failure() {
        let locks = locks();
        let wait = Duration::from_millis(20);
        let unit = UnitAddress::from_str("m1").unwrap();

        let second = locks.acquire(&addr("ch:m1:2"), wait).await.unwrap();
        assert!(locks.acquire_unit(&unit, wait).await.is_none());
        assert!(!locks.is_locked(&addr("ch:m1:1")));

        drop(second);
        let both = locks.acquire_unit(&unit, wait).await.unwrap();
        assert_eq!(both[1].addr(), &addr("ch:m1:2"));
    }
}
