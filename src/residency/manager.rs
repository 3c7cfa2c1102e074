use log::{error, info};
use std::{
    path::Path,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use crate::background::processors::image::letterbox_from_path;
use crate::residency::ResidencyError;
use crate::residency::backend::{LoadedModel, ModelLoader, normalize};
use crate::residency::registry::{ModelRegistry, ModelSpec};

/// How a `run` call found the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residence {
    ColdStart,
    ColdSwitch,
    WarmHit,
}

struct Resident {
    spec: ModelSpec,
    handle: Box<dyn LoadedModel>,
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicU64,
    unloads: AtomicU64,
    warm_hits: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResidencyStats {
    pub loads: u64,
    pub unloads: u64,
    pub warm_hits: u64,
}

/// Owns the one backend that may be loaded at a time.
///
/// Every access goes through [`ResidencyManager::run`], which holds the slot
/// lock for the whole call: concurrent jobs serialize here regardless of the
/// model they ask for.
pub struct ResidencyManager {
    registry: ModelRegistry,
    loader: Box<dyn ModelLoader>,
    slot: Mutex<Option<Resident>>,
    counters: Counters,
}

impl ResidencyManager {
    pub fn new(registry: ModelRegistry, loader: impl ModelLoader + 'static) -> Self {
        Self {
            registry,
            loader: Box::new(loader),
            slot: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn supports(&self, model_name: &str) -> bool {
        self.registry.contains(model_name)
    }

    /// Name of the resident model, if any. Waits behind an in-progress run.
    pub fn current_model(&self) -> Option<&'static str> {
        self.lock_slot().as_ref().map(|resident| resident.spec.name)
    }

    pub fn stats(&self) -> ResidencyStats {
        ResidencyStats {
            loads: self.counters.loads.load(Ordering::SeqCst),
            unloads: self.counters.unloads.load(Ordering::SeqCst),
            warm_hits: self.counters.warm_hits.load(Ordering::SeqCst),
        }
    }

    /// Produce tags for `image_path` with `model_name`, loading or switching
    /// the resident backend first when needed.
    pub fn run(&self, image_path: &Path, model_name: &str) -> Result<Vec<String>, ResidencyError> {
        let spec = self
            .registry
            .get(model_name)
            .cloned()
            .ok_or_else(|| ResidencyError::InvalidModel(model_name.to_string()))?;
        info!("Processing {:?} with model {}", image_path, model_name);

        let mut slot = self.lock_slot();

        let (mut resident, residence) = match slot.take() {
            Some(resident) if resident.spec.name == spec.name => {
                self.counters.warm_hits.fetch_add(1, Ordering::SeqCst);
                (resident, Residence::WarmHit)
            }
            Some(previous) => {
                info!("Changing model, tearing down model {}", previous.spec.name);
                self.release(previous);
                (self.acquire(&spec)?, Residence::ColdSwitch)
            }
            None => {
                info!("No current model, setting up");
                (self.acquire(&spec)?, Residence::ColdStart)
            }
        };

        let image = match letterbox_from_path(image_path, spec.input_size) {
            Ok(image) => image,
            Err(e) => {
                // The input is at fault, not the backend: keep it resident.
                *slot = Some(resident);
                return Err(ResidencyError::Backend(format!(
                    "Failed to prepare image {:?}: {:#}",
                    image_path, e
                )));
            }
        };

        let start_time = Instant::now();
        let outcome = resident
            .handle
            .infer(&image)
            .and_then(|prediction| normalize(spec.family, prediction));

        match outcome {
            Ok(tags) => {
                info!(
                    duration = &*format!("{:?}", start_time.elapsed());
                    "Inference with {} ({:?}) produced {} tags",
                    spec.name,
                    residence,
                    tags.len()
                );
                *slot = Some(resident);
                Ok(tags)
            }
            Err(e) => {
                // A failed handle is not trusted for the next job.
                self.release(resident);
                Err(ResidencyError::Backend(format!(
                    "Inference with {} failed: {:#}",
                    spec.name, e
                )))
            }
        }
    }

    /// Explicitly drop the resident backend, if any.
    pub fn evict(&self) {
        if let Some(resident) = self.lock_slot().take() {
            self.release(resident);
        }
    }

    fn acquire(&self, spec: &ModelSpec) -> Result<Resident, ResidencyError> {
        info!("Setting up model: {}", spec.name);
        let start_time = Instant::now();
        let handle = self.loader.load(spec).map_err(|e| {
            ResidencyError::Backend(format!("Failed to load model {}: {:#}", spec.name, e))
        })?;
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        info!(
            duration = &*format!("{:?}", start_time.elapsed());
            "Loaded model {} ({})", spec.name, spec.family
        );
        Ok(Resident {
            spec: spec.clone(),
            handle,
        })
    }

    fn release(&self, resident: Resident) {
        let name = resident.spec.name;
        if let Err(e) = resident.handle.unload() {
            error!("Error while unloading model {}: {:#}", name, e);
        }
        self.counters.unloads.fetch_add(1, Ordering::SeqCst);
        info!("Tore down model {}", name);
    }

    // A panic mid-run leaves the slot empty or holding a whole resident, so a
    // poisoned lock is still consistent.
    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<Resident>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ResidencyManager {
    fn drop(&mut self) {
        self.evict();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::residency::backend::Prediction;
    use crate::residency::registry::BackendFamily;
    use anyhow::{Result, bail};
    use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Shared observation point for fake backends.
    #[derive(Debug, Default)]
    pub(crate) struct Probe {
        pub loads: AtomicU64,
        pub unloads: AtomicU64,
        pub live: AtomicU64,
        pub max_live: AtomicU64,
        pub in_flight: AtomicU64,
        pub violations: AtomicU64,
        pub infers: AtomicU64,
        pub fail_next_load: AtomicBool,
        pub fail_next_infer: AtomicBool,
    }

    pub(crate) struct FakeLoader {
        pub probe: Arc<Probe>,
        pub infer_delay: Duration,
    }

    struct FakeModel {
        spec: ModelSpec,
        probe: Arc<Probe>,
        infer_delay: Duration,
    }

    impl ModelLoader for FakeLoader {
        fn load(&self, spec: &ModelSpec) -> Result<Box<dyn LoadedModel>> {
            if self.probe.fail_next_load.swap(false, Ordering::SeqCst) {
                bail!("out of device memory");
            }
            self.probe.loads.fetch_add(1, Ordering::SeqCst);
            let live = self.probe.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(Box::new(FakeModel {
                spec: spec.clone(),
                probe: self.probe.clone(),
                infer_delay: self.infer_delay,
            }))
        }
    }

    impl LoadedModel for FakeModel {
        fn infer(&mut self, image: &DynamicImage) -> Result<Prediction> {
            if self.probe.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                self.probe.violations.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(self.infer_delay);
            self.probe.infers.fetch_add(1, Ordering::SeqCst);
            self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.probe.fail_next_infer.swap(false, Ordering::SeqCst) {
                bail!("device lost");
            }
            assert_eq!(image.dimensions(), (self.spec.input_size, self.spec.input_size));
            Ok(match self.spec.family {
                BackendFamily::Captioning => {
                    Prediction::Caption(format!("Tagged By {}", self.spec.name))
                }
                BackendFamily::Tagging => Prediction::Scores(vec![
                    (format!("{}_label", self.spec.name), 0.9),
                    ("noise".to_string(), 0.1),
                ]),
            })
        }

        fn unload(self: Box<Self>) -> Result<()> {
            self.probe.unloads.fetch_add(1, Ordering::SeqCst);
            self.probe.live.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn test_registry() -> ModelRegistry {
        ModelRegistry::new([
            ModelSpec::new("modelA", BackendFamily::Captioning, 32),
            ModelSpec::new("modelB", BackendFamily::Tagging, 64),
            ModelSpec::new("modelC", BackendFamily::Captioning, 16),
        ])
    }

    pub(crate) fn fake_manager(infer_delay: Duration) -> (ResidencyManager, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let loader = FakeLoader {
            probe: probe.clone(),
            infer_delay,
        };
        (ResidencyManager::new(test_registry(), loader), probe)
    }

    pub(crate) fn write_png(path: &Path, width: u32, height: u32) {
        RgbImage::from_pixel(width, height, Rgb([200, 100, 50]))
            .save(path)
            .unwrap();
    }

    fn image_fixture() -> (TempDir, std::path::PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cat.png");
        write_png(&path, 40, 20);
        (tmp, path)
    }

    #[test]
    fn alternating_models_switch_residency() {
        let (_tmp, image) = image_fixture();
        let (manager, probe) = fake_manager(Duration::ZERO);

        assert_eq!(manager.run(&image, "modelA").unwrap(), vec!["tagged", "by", "modela"]);
        assert_eq!(manager.run(&image, "modelB").unwrap(), vec!["modelb label"]);
        assert_eq!(manager.run(&image, "modelA").unwrap(), vec!["tagged", "by", "modela"]);

        assert_eq!(probe.loads.load(Ordering::SeqCst), 3);
        assert_eq!(probe.unloads.load(Ordering::SeqCst), 2);
        assert_eq!(probe.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.stats(),
            ResidencyStats {
                loads: 3,
                unloads: 2,
                warm_hits: 0
            }
        );
        assert_eq!(manager.current_model(), Some("modelA"));
    }

    #[test]
    fn same_model_twice_loads_once() {
        let (_tmp, image) = image_fixture();
        let (manager, probe) = fake_manager(Duration::ZERO);

        manager.run(&image, "modelA").unwrap();
        manager.run(&image, "modelA").unwrap();

        assert_eq!(probe.loads.load(Ordering::SeqCst), 1);
        assert_eq!(probe.unloads.load(Ordering::SeqCst), 0);
        assert_eq!(manager.stats().warm_hits, 1);
    }

    #[test]
    fn unknown_model_leaves_residency_untouched() {
        let (_tmp, image) = image_fixture();
        let (manager, probe) = fake_manager(Duration::ZERO);
        manager.run(&image, "modelA").unwrap();

        let err = manager.run(&image, "modelZ").unwrap_err();
        assert_eq!(err, ResidencyError::InvalidModel("modelZ".into()));
        assert_eq!(err.to_string(), "Invalid model: modelZ");
        assert_eq!(manager.current_model(), Some("modelA"));
        assert_eq!(probe.loads.load(Ordering::SeqCst), 1);
        assert_eq!(probe.unloads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_load_leaves_slot_empty_and_recovers() {
        let (_tmp, image) = image_fixture();
        let (manager, probe) = fake_manager(Duration::ZERO);
        manager.run(&image, "modelA").unwrap();

        probe.fail_next_load.store(true, Ordering::SeqCst);
        let err = manager.run(&image, "modelB").unwrap_err();
        assert!(matches!(err, ResidencyError::Backend(ref m) if m.contains("out of device memory")));
        assert_eq!(manager.current_model(), None);
        assert_eq!(probe.live.load(Ordering::SeqCst), 0);

        manager.run(&image, "modelB").unwrap();
        assert_eq!(manager.current_model(), Some("modelB"));
    }

    #[test]
    fn failed_inference_evicts_the_backend() {
        let (_tmp, image) = image_fixture();
        let (manager, probe) = fake_manager(Duration::ZERO);

        probe.fail_next_infer.store(true, Ordering::SeqCst);
        assert!(matches!(
            manager.run(&image, "modelA"),
            Err(ResidencyError::Backend(_))
        ));
        assert_eq!(manager.current_model(), None);
        assert_eq!(probe.live.load(Ordering::SeqCst), 0);

        manager.run(&image, "modelA").unwrap();
        assert_eq!(probe.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn undecodable_image_keeps_backend_resident() {
        let (tmp, image) = image_fixture();
        let (manager, probe) = fake_manager(Duration::ZERO);
        manager.run(&image, "modelA").unwrap();

        let broken = tmp.path().join("broken.png");
        std::fs::write(&broken, b"nope").unwrap();
        assert!(matches!(
            manager.run(&broken, "modelA"),
            Err(ResidencyError::Backend(_))
        ));
        assert_eq!(manager.current_model(), Some("modelA"));
        assert_eq!(probe.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_runs_never_overlap() {
        let (_tmp, image) = image_fixture();
        let (manager, probe) = fake_manager(Duration::from_millis(20));
        let manager = Arc::new(manager);

        let handles: Vec<_> = ["modelA", "modelB", "modelC", "modelA", "modelB", "modelC"]
            .into_iter()
            .map(|model| {
                let manager = manager.clone();
                let image = image.clone();
                std::thread::spawn(move || manager.run(&image, model).unwrap())
            })
            .collect();
        for handle in handles {
            assert!(!handle.join().unwrap().is_empty());
        }

        assert_eq!(probe.infers.load(Ordering::SeqCst), 6);
        assert_eq!(probe.violations.load(Ordering::SeqCst), 0);
        assert_eq!(probe.max_live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_the_resident_backend() {
        let (_tmp, image) = image_fixture();
        let (manager, probe) = fake_manager(Duration::ZERO);
        manager.run(&image, "modelB").unwrap();
        drop(manager);
        assert_eq!(probe.live.load(Ordering::SeqCst), 0);
    }
}
