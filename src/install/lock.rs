use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::product::ProductKind;

/// Per-product "install in progress" markers shared by every runner of a session.
#[derive(Clone, Default)]
pub struct InstallLocks {
    held: Arc<Mutex<HashSet<ProductKind>>>,
}

impl InstallLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `product`, or `None` when someone else holds it.
    pub fn try_acquire(&self, product: ProductKind) -> Option<InstallGuard> {
        let mut held = self.lock();
        if !held.insert(product) {
            debug!("locks: {product} already held");
            return None;
        }
        debug!("locks: acquired {product}");
        Some(InstallGuard {
            held: self.held.clone(),
            product,
        })
    }

    /// Claim every product in `products`, in `ProductKind` order.
    ///
    /// All or nothing: on a busy product the guards taken so far are released and that product
    /// is returned.
    pub fn try_acquire_all(&self, products: &[ProductKind]) -> Result<Vec<InstallGuard>, ProductKind> {
        let mut ordered = products.to_vec();
        ordered.sort();
        ordered.dedup();
        let mut guards = Vec::with_capacity(ordered.len());
        for product in ordered {
            match self.try_acquire(product) {
                Some(guard) => guards.push(guard),
                None => return Err(product),
            }
        }
        Ok(guards)
    }

    pub fn is_held(&self, product: ProductKind) -> bool {
        self.lock().contains(&product)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<ProductKind>> {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the product marker when dropped.
pub struct InstallGuard {
    held: Arc<Mutex<HashSet<ProductKind>>>,
    product: ProductKind,
}

impl InstallGuard {
    pub fn product(&self) -> ProductKind {
        self.product
    }
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.product);
        debug!("locks: released {}", self.product);
    }
}
