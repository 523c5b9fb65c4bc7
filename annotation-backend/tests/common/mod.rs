#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use base64::Engine;
use serde_json::{json, Value};
use tower::ServiceExt;
use unified_detector::{
    BoxDetection, DetectionResult, MaskDetection, ModelRegistry, Prediction, StaticDetector,
};
use uuid::Uuid;

use annotation_backend::config::AppConfig;
use annotation_backend::pipeline::{spawn_dispatcher, DispatcherConfig, Orchestrator, TracingNotifier};
use annotation_backend::store::{AnnotationStore, InMemoryStore};
use annotation_backend::{create_app, AppState};

pub struct TestApp {
    pub router: Router,
    pub store: Arc<dyn AnnotationStore>,
}

pub struct Detectors {
    pub room: Arc<StaticDetector>,
    pub wall: Arc<StaticDetector>,
    pub window_door: Arc<StaticDetector>,
}

impl Detectors {
    /// One room, one wall and one door on a 200x200 page
    pub fn standard() -> Self {
        Self {
            room: Arc::new(StaticDetector::new("room", room_prediction())),
            wall: Arc::new(StaticDetector::new(
                "wall",
                boxes_prediction("wall exterior", [0.0, 0.0, 150.0, 12.0]),
            )),
            window_door: Arc::new(StaticDetector::new(
                "window_door",
                boxes_prediction("door", [10.0, 10.0, 40.0, 20.0]),
            )),
        }
    }

    /// Like `standard` but the window/door model finds nothing
    pub fn without_openings() -> Self {
        Self {
            window_door: Arc::new(StaticDetector::empty("window_door")),
            ..Self::standard()
        }
    }

    fn registry(&self) -> ModelRegistry {
        ModelRegistry::new(
            self.room.clone(),
            self.wall.clone(),
            self.window_door.clone(),
        )
    }
}

pub fn room_prediction() -> Prediction {
    Prediction {
        image_width: 200,
        image_height: 200,
        names: HashMap::from([(0, "living room".to_string())]),
        result: DetectionResult::Masks {
            detections: vec![MaskDetection {
                class_id: 0,
                polygon: vec![[20.0, 20.0], [120.0, 20.0], [120.0, 120.0], [20.0, 120.0]],
                confidence: None,
            }],
            probs: Some(vec![0.93]),
        },
    }
}

pub fn boxes_prediction(label: &str, xyxy: [f64; 4]) -> Prediction {
    Prediction {
        image_width: 200,
        image_height: 200,
        names: HashMap::from([(0, label.to_string())]),
        result: DetectionResult::Boxes {
            detections: vec![BoxDetection {
                class_id: 0,
                xyxy,
                confidence: Some(0.7),
            }],
            probs: None,
        },
    }
}

/// Build the router with an in-memory store and a running stage dispatcher.
/// Must be called inside a tokio runtime.
pub fn build_test_app(detectors: &Detectors) -> TestApp {
    let config = AppConfig::default();
    let store: Arc<dyn AnnotationStore> = Arc::new(InMemoryStore::new());
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::new(detectors.registry()),
        Arc::new(TracingNotifier),
    );
    let pipeline = spawn_dispatcher(orchestrator, DispatcherConfig::default());

    TestApp {
        router: create_app(
            AppState {
                store: Arc::clone(&store),
                pipeline,
            },
            &config,
        ),
        store,
    }
}

pub fn png_base64(width: u32, height: u32) -> String {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([255, 255, 255]));
    let mut buf = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .unwrap();
    base64::engine::general_purpose::STANDARD.encode(buf.into_inner())
}

/// Send a request and decode the JSON body (`Null` when empty)
pub async fn send(
    app: &TestApp,
    method: Method,
    uri: &str,
    user: Option<Uuid>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user.to_string());
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    (status, json)
}

pub async fn create_user(app: &TestApp, role: &str) -> Uuid {
    let (status, body) = send(
        app,
        Method::POST,
        "/users",
        None,
        Some(json!({ "name": format!("{} user", role), "email": "user@example.com", "role": role })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().parse().unwrap()
}

pub async fn register_image(app: &TestApp, owner: Uuid, dpi: Option<u32>, scale: Option<f64>) -> Uuid {
    let (status, body) = send(
        app,
        Method::POST,
        "/blueprint-images",
        None,
        Some(json!({
            "title": "Plan A - Page 1",
            "owner_id": owner,
            "dpi": dpi,
            "scale": scale,
            "image": png_base64(200, 200),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register failed: {}", body);
    body["id"].as_str().unwrap().parse().unwrap()
}

/// Poll the image record until `done` holds, returning the last record seen
pub async fn wait_for_image<F>(app: &TestApp, image_id: Uuid, done: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    let uri = format!("/blueprint-images/{}", image_id);
    let mut last = Value::Null;
    for _ in 0..300 {
        let (_, body) = send(app, Method::GET, &uri, None, None).await;
        if done(&body) {
            return body;
        }
        last = body;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("image {} never reached the expected state: {}", image_id, last);
}

pub async fn wait_until_annotated(app: &TestApp, image_id: Uuid) -> Value {
    wait_for_image(app, image_id, |img| img["pipeline"]["state"] == "annotated").await
}
