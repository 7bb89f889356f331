use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::engine::Classify;
use crate::error::EngineError;

type Loader = Box<dyn Fn() -> Result<Arc<dyn Classify>, EngineError> + Send + Sync>;

/// Holds the classifier once it is loaded.
///
/// The loader runs under the lock, so concurrent first requests wait for one
/// download-and-load instead of racing each other. A failed load leaves the
/// slot empty and the next caller tries again.
pub struct ModelSlot {
    loaded: Mutex<Option<Arc<dyn Classify>>>,
    loader: Loader,
}

impl ModelSlot {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Classify>, EngineError> + Send + Sync + 'static,
    {
        Self {
            loaded: Mutex::new(None),
            loader: Box::new(loader),
        }
    }

    /// Blocks while loading; call from a blocking context.
    pub fn get_or_load(&self) -> Result<Arc<dyn Classify>, EngineError> {
        let mut slot = self.loaded.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(classifier) = slot.as_ref() {
            return Ok(Arc::clone(classifier));
        }
        let classifier = (self.loader)()?;
        *slot = Some(Arc::clone(&classifier));
        Ok(classifier)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }
}

pub struct AppState {
    pub model: ModelSlot,
    pub static_dir: PathBuf,
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use image::RgbImage;

    use super::ModelSlot;
    use crate::engine::{Classify, Prediction};
    use crate::error::EngineError;

    pub struct FixedClassifier(pub Prediction);

    impl Classify for FixedClassifier {
        fn predict(&self, _image: &RgbImage) -> Result<Prediction, EngineError> {
            Ok(self.0.clone())
        }
    }

    /// Slot whose loader counts invocations and hands out a fixed "relax" classifier.
    pub fn counting_slot() -> (ModelSlot, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let slot = ModelSlot::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(Arc::new(FixedClassifier(Prediction {
                emotion: "relax",
                confidence: 0.8,
            })) as Arc<dyn Classify>)
        });
        (slot, loads)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::testing::counting_slot;
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn concurrent_first_calls_load_once() {
        let (slot, loads) = counting_slot();
        let slot = Arc::new(slot);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slot = Arc::clone(&slot);
                std::thread::spawn(move || slot.get_or_load().map(|_| ()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(slot.is_loaded());
    }

    #[test]
    fn failed_load_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let slot = ModelSlot::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Policy("no weights".to_string()))
        });

        assert!(slot.get_or_load().is_err());
        assert!(slot.get_or_load().is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!slot.is_loaded());
    }
}
