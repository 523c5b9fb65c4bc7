use std::sync::Arc;
use tracing::info;

use crate::adapter::LabelPolicy;
use crate::yolo::{HttpYoloDetector, YoloConfig, YoloDetector};
use crate::AnnotationKind;

/// A loaded model plus the label policy its class table needs
#[derive(Clone)]
pub struct RegisteredModel {
    pub detector: Arc<dyn YoloDetector>,
    pub label_policy: LabelPolicy,
}

/// One detector per annotation kind, built once at startup and shared
/// read-only by every pipeline stage.
#[derive(Clone)]
pub struct ModelRegistry {
    room: RegisteredModel,
    wall: RegisteredModel,
    window_door: RegisteredModel,
}

impl ModelRegistry {
    pub fn new(
        room: Arc<dyn YoloDetector>,
        wall: Arc<dyn YoloDetector>,
        window_door: Arc<dyn YoloDetector>,
    ) -> Self {
        let register = |detector: Arc<dyn YoloDetector>, kind: AnnotationKind| RegisteredModel {
            detector,
            label_policy: default_label_policy(kind),
        };

        Self {
            room: register(room, AnnotationKind::Room),
            wall: register(wall, AnnotationKind::Wall),
            window_door: register(window_door, AnnotationKind::WindowDoor),
        }
    }

    /// Build HTTP-backed detectors for all three kinds.
    ///
    /// Must not be called from inside an async context: the blocking client
    /// owns its own runtime.
    pub fn from_configs(
        room: YoloConfig,
        wall: YoloConfig,
        window_door: YoloConfig,
    ) -> anyhow::Result<Self> {
        let registry = Self::new(
            Arc::new(HttpYoloDetector::new(room)?),
            Arc::new(HttpYoloDetector::new(wall)?),
            Arc::new(HttpYoloDetector::new(window_door)?),
        );

        for kind in AnnotationKind::CHAIN {
            info!("Registered {} model: {}", kind, registry.model(kind).detector.model_info());
        }

        Ok(registry)
    }

    pub fn model(&self, kind: AnnotationKind) -> &RegisteredModel {
        match kind {
            AnnotationKind::Room => &self.room,
            AnnotationKind::Wall => &self.wall,
            AnnotationKind::WindowDoor => &self.window_door,
        }
    }

    /// Override the label policy for one kind
    pub fn with_label_policy(mut self, kind: AnnotationKind, policy: LabelPolicy) -> Self {
        match kind {
            AnnotationKind::Room => self.room.label_policy = policy,
            AnnotationKind::Wall => self.wall.label_policy = policy,
            AnnotationKind::WindowDoor => self.window_door.label_policy = policy,
        }
        self
    }
}

/// The wall model's class names carry a qualifier after the first token
fn default_label_policy(kind: AnnotationKind) -> LabelPolicy {
    match kind {
        AnnotationKind::Wall => LabelPolicy::FirstToken,
        AnnotationKind::Room | AnnotationKind::WindowDoor => LabelPolicy::FullName,
    }
}
