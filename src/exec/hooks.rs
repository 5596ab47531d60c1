//! Pre/post host-function hooks: at most one of each, fire-and-forget,
//! invoked around every host call. Readers take the shared lock on the hot
//! path; registration takes the exclusive lock.

use std::sync::RwLock;

/// Opaque user data passed back to a hook.
pub type HookData = usize;
pub type HookFn = fn(HookData);

#[derive(Default)]
pub struct HostHooks {
    pre: RwLock<Option<(HookData, HookFn)>>,
    post: RwLock<Option<(HookData, HookFn)>>,
}

impl HostHooks {
    pub fn set_pre(&self, data: HookData, f: HookFn) {
        *self.pre.write().expect("hook lock") = Some((data, f));
    }

    pub fn set_post(&self, data: HookData, f: HookFn) {
        *self.post.write().expect("hook lock") = Some((data, f));
    }

    pub fn invoke_pre(&self) {
        if let Some((data, f)) = *self.pre.read().expect("hook lock") {
            f(data);
        }
    }

    pub fn invoke_post(&self) {
        if let Some((data, f)) = *self.post.read().expect("hook lock") {
            f(data);
        }
    }
}

impl std::fmt::Debug for HostHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHooks").finish_non_exhaustive()
    }
}
