#[cfg(test)]
pub mod env {
    //! Serialises tests that touch process environment and restores every
    //! variable they changed.

    use once_cell::sync::Lazy;
    use std::collections::BTreeMap;
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    pub struct EnvGuard {
        previous: BTreeMap<String, Option<String>>,
        _lock: MutexGuard<'static, ()>,
    }

    pub fn guard() -> EnvGuard {
        // A panicking test poisons the lock; the environment is restored by
        // its guard's Drop regardless.
        let lock = ENV_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        EnvGuard {
            previous: BTreeMap::new(),
            _lock: lock,
        }
    }

    impl EnvGuard {
        fn record(&mut self, key: &str) {
            self.previous
                .entry(key.to_string())
                .or_insert_with(|| std::env::var(key).ok());
        }

        pub fn set(&mut self, key: &str, value: &str) {
            self.record(key);
            std::env::set_var(key, value);
        }

        pub fn unset(&mut self, key: &str) {
            self.record(key);
            std::env::remove_var(key);
        }

        pub fn clear(&mut self, keys: &[&str]) {
            keys.iter().for_each(|key| self.unset(key));
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in std::mem::take(&mut self.previous) {
                match value {
                    Some(value) => std::env::set_var(&key, value),
                    None => std::env::remove_var(&key),
                }
            }
        }
    }

    mod tests {
        use super::*;

        #[test]
        fn dropping_the_guard_restores_changed_variables() {
            const KEY: &str = "CONDUIT_TEST_SUPPORT_RESTORE";
            {
                let mut env = guard();
                env.unset(KEY);
                env.set(KEY, "temporary");
                env.set(KEY, "overwritten");
                assert_eq!(std::env::var(KEY).as_deref(), Ok("overwritten"));
            }
            assert!(std::env::var(KEY).is_err());
            let _next = guard();
        }
    }
}
