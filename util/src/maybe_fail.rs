use lazy_static::lazy_static;
use log::*;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy)]
struct Armed {
    skip: u64,
    count: u64,
}

/// Named-site fault injection. Sites are identified by a string (e.g.
/// "alloc_log_block"); tests arm a site to fail `count` times after `skip`
/// successful hits. Unarmed sites never fire, so the hooks are free in
/// production use.
#[derive(Debug, Default)]
pub struct FailInjector {
    sites: Mutex<HashMap<String, Armed>>,
}

impl FailInjector {
    pub fn arm(&self, site: &str, skip: u64, count: u64) {
        self.sites
            .lock()
            .unwrap()
            .insert(site.to_string(), Armed { skip, count });
    }

    pub fn disarm(&self, site: &str) {
        self.sites.lock().unwrap().remove(site);
    }

    /// Returns true if this hit should fail.
    pub fn hit(&self, site: &str) -> bool {
        let mut sites = self.sites.lock().unwrap();
        let armed = match sites.get_mut(site) {
            Some(armed) => armed,
            None => return false,
        };
        if armed.skip > 0 {
            armed.skip -= 1;
            return false;
        }
        if armed.count == 0 {
            return false;
        }
        armed.count -= 1;
        warn!("injecting failure at site {:?}", site);
        true
    }
}

lazy_static! {
    static ref GLOBAL_INJECTOR: FailInjector = Default::default();
}

pub fn maybe_fail_with(site: &str) -> bool {
    GLOBAL_INJECTOR.hit(site)
}

impl FailInjector {
    pub fn global() -> &'static FailInjector {
        &GLOBAL_INJECTOR
    }
}
