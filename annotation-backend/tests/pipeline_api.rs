//! End-to-end tests for the annotation chain, recalculation and verification.

mod common;

use axum::http::{Method, StatusCode};
use common::{build_test_app, create_user, register_image, send, wait_for_image, wait_until_annotated, Detectors};
use serde_json::json;
use std::time::Duration;
use unified_detector::AnnotationKind;

#[tokio::test]
async fn health_check_returns_version() {
    let app = build_test_app(&Detectors::standard());

    let (status, body) = send(&app, Method::GET, "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn trigger_runs_full_chain() {
    let detectors = Detectors::standard();
    let app = build_test_app(&detectors);
    let owner = create_user(&app, "customer").await;
    let image_id = register_image(&app, owner, Some(100), Some(1.0)).await;

    let (status, body) = send(&app, Method::POST, &format!("/blueprint-images/{}/annotate", image_id), Some(owner), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");

    let image = wait_until_annotated(&app, image_id).await;
    assert_eq!(image["pipeline"]["last_error"], serde_json::Value::Null);

    let (_, annotations) = send(&app, Method::GET, &format!("/blueprint-images/{}/annotations", image_id), None, None).await;
    let rooms = annotations["room"].as_array().unwrap();
    let walls = annotations["wall"].as_array().unwrap();
    let openings = annotations["window_door"].as_array().unwrap();
    assert_eq!((rooms.len(), walls.len(), openings.len()), (1, 1, 1));

    assert_eq!(rooms[0]["label"], "living room");
    assert_eq!(rooms[0]["confidence_score"], 0.93);
    assert!(rooms[0]["area"].as_f64().unwrap() > 0.0);
    // Wall labels keep only the first token
    assert_eq!(walls[0]["label"], "wall");
    assert_eq!(walls[0]["length"], 1.5);
    assert_eq!(walls[0]["thickness"], 0.12);
    assert_eq!(openings[0]["length"], 0.3);
    assert_eq!(openings[0]["breadth"], 0.1);

    // Each stage started only after the previous one stored its rows
    let room_at = rooms[0]["created_at"].as_str().unwrap().to_string();
    let wall_at = walls[0]["created_at"].as_str().unwrap().to_string();
    let opening_at = openings[0]["created_at"].as_str().unwrap().to_string();
    let parse = |s: &str| chrono::DateTime::parse_from_rfc3339(s).unwrap();
    assert!(parse(&room_at) <= parse(&wall_at));
    assert!(parse(&wall_at) <= parse(&opening_at));

    assert_eq!(detectors.room.calls(), 1);
    assert_eq!(detectors.wall.calls(), 1);
    assert_eq!(detectors.window_door.calls(), 1);
}

#[tokio::test]
async fn retrigger_does_not_duplicate_or_redetect() {
    let detectors = Detectors::standard();
    let app = build_test_app(&detectors);
    let owner = create_user(&app, "customer").await;
    let image_id = register_image(&app, owner, Some(100), Some(1.0)).await;
    let uri = format!("/blueprint-images/{}/annotate", image_id);

    send(&app, Method::POST, &uri, Some(owner), None).await;
    wait_until_annotated(&app, image_id).await;

    let (status, body) = send(&app, Method::POST, &uri, Some(owner), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["state"], "annotated");
    tokio::time::sleep(Duration::from_millis(200)).await;

    for kind in AnnotationKind::CHAIN {
        assert_eq!(app.store.count_annotations(image_id, kind).unwrap(), 1);
    }
    assert_eq!(detectors.room.calls(), 1);
    assert_eq!(detectors.wall.calls(), 1);
    assert_eq!(detectors.window_door.calls(), 1);
}

#[tokio::test]
async fn trigger_requires_owner_or_estimator() {
    let detectors = Detectors::standard();
    let app = build_test_app(&detectors);
    let owner = create_user(&app, "customer").await;
    let stranger = create_user(&app, "customer").await;
    let image_id = register_image(&app, owner, Some(100), Some(1.0)).await;
    let uri = format!("/blueprint-images/{}/annotate", image_id);

    let (status, body) = send(&app, Method::POST, &uri, Some(stranger), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "PERMISSION_DENIED");

    let (status, body) = send(&app, Method::POST, &uri, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "UNAUTHORIZED");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(detectors.room.calls(), 0);

    // Estimators may annotate any image
    let estimator = create_user(&app, "estimator").await;
    let (status, _) = send(&app, Method::POST, &uri, Some(estimator), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_until_annotated(&app, image_id).await;
}

#[tokio::test]
async fn missing_calibration_fails_stage_without_annotations() {
    let detectors = Detectors::standard();
    let app = build_test_app(&detectors);
    let owner = create_user(&app, "customer").await;
    let image_id = register_image(&app, owner, None, Some(1.0)).await;

    send(&app, Method::POST, &format!("/blueprint-images/{}/annotate", image_id), Some(owner), None).await;
    let image = wait_for_image(&app, image_id, |img| !img["pipeline"]["last_error"].is_null()).await;

    assert_eq!(image["pipeline"]["state"], "no_annotations");
    assert!(image["pipeline"]["last_error"].as_str().unwrap().contains("calibration missing"));
    assert_eq!(detectors.room.calls(), 0);
    assert_eq!(detectors.wall.calls(), 0);
}

#[tokio::test]
async fn calibration_change_recalculates_in_place() {
    let app = build_test_app(&Detectors::standard());
    let owner = create_user(&app, "customer").await;
    let image_id = register_image(&app, owner, Some(100), Some(1.0)).await;
    send(&app, Method::POST, &format!("/blueprint-images/{}/annotate", image_id), Some(owner), None).await;
    wait_until_annotated(&app, image_id).await;

    let annotations_uri = format!("/blueprint-images/{}/annotations", image_id);
    let calibration_uri = format!("/blueprint-images/{}/calibration", image_id);
    let (_, before) = send(&app, Method::GET, &annotations_uri, None, None).await;

    // Within tolerance: the value is kept, measurements are not touched
    let (status, body) = send(&app, Method::PUT, &calibration_uri, Some(owner), Some(json!({ "scale": 1.008 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], false);
    assert_eq!(body["recalculated"], 0);
    assert_eq!(body["image"]["scale"], 1.008);
    let (_, unchanged) = send(&app, Method::GET, &annotations_uri, None, None).await;
    assert_eq!(unchanged, before);

    let (status, body) = send(&app, Method::PUT, &calibration_uri, Some(owner), Some(json!({ "scale": 2.0 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], true);
    assert_eq!(body["recalculated"], 3);

    let (_, after) = send(&app, Method::GET, &annotations_uri, None, None).await;
    let room_before = before["room"][0]["area"].as_f64().unwrap();
    let room_after = after["room"][0]["area"].as_f64().unwrap();
    assert!((room_after - room_before / 4.0).abs() < 1e-9);
    assert_eq!(after["room"][0]["coordinates"], before["room"][0]["coordinates"]);
    assert_eq!(after["wall"][0]["length"], 0.75);
    assert_eq!(after["wall"][0]["thickness"], 0.06);
    assert_eq!(after["window_door"][0]["length"], 0.15);
}

#[tokio::test]
async fn calibration_rejects_non_positive_values() {
    let app = build_test_app(&Detectors::standard());
    let owner = create_user(&app, "customer").await;
    let image_id = register_image(&app, owner, Some(100), Some(1.0)).await;

    let (status, body) = send(
        &app,
        Method::PUT,
        &format!("/blueprint-images/{}/calibration", image_id),
        Some(owner),
        Some(json!({ "scale": 0.0 })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn verification_gate_names_missing_kind() {
    let app = build_test_app(&Detectors::without_openings());
    let owner = create_user(&app, "customer").await;
    let estimator = create_user(&app, "estimator").await;
    let image_id = register_image(&app, owner, Some(100), Some(1.0)).await;
    send(&app, Method::POST, &format!("/blueprint-images/{}/annotate", image_id), Some(owner), None).await;
    wait_until_annotated(&app, image_id).await;

    let verify_uri = format!("/blueprint-images/{}/verify", image_id);
    let (status, body) = send(&app, Method::POST, &verify_uri, Some(estimator), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ANNOTATIONS_MISSING");
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("window/door annotation"));
    assert!(!message.contains("wall annotation"));

    let (status, _) = send(
        &app,
        Method::POST,
        "/annotations/window_door",
        Some(estimator),
        Some(json!({
            "blueprint_image_id": image_id,
            "label": "window",
            "coordinates": [[50, 50], [80, 50], [80, 55], [50, 55]],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, Method::POST, &verify_uri, Some(estimator), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_verified"], true);
}

#[tokio::test]
async fn degenerate_manual_annotation_is_rejected() {
    let app = build_test_app(&Detectors::standard());
    let owner = create_user(&app, "customer").await;
    let image_id = register_image(&app, owner, Some(100), Some(1.0)).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/annotations/room",
        Some(owner),
        Some(json!({ "blueprint_image_id": image_id, "label": "closet", "coordinates": [[5, 5]] })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_GEOMETRY");
    assert_eq!(app.store.count_annotations(image_id, AnnotationKind::Room).unwrap(), 0);
}

#[tokio::test]
async fn export_artifact_is_served() {
    let app = build_test_app(&Detectors::standard());
    let owner = create_user(&app, "customer").await;
    let image_id = register_image(&app, owner, Some(100), Some(1.0)).await;
    send(&app, Method::POST, &format!("/blueprint-images/{}/annotate", image_id), Some(owner), None).await;
    wait_until_annotated(&app, image_id).await;

    let (status, doc) = send(&app, Method::GET, &format!("/blueprint-images/{}/exports/room", image_id), None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["version"], "4.5.6");
    assert_eq!(doc["imagePath"], "Plan A - Page 1");
    assert_eq!(doc["imageWidth"], 200);
    assert_eq!(doc["imageHeight"], 200);
    assert_eq!(doc["shapes"][0]["shape_type"], "polygon");
    assert_eq!(doc["shapes"][0]["confidence_score"], 0.93);
    assert!(doc["shapes"][0]["measurement"].as_f64().unwrap() > 0.0);

    let (_, walls) = send(&app, Method::GET, &format!("/blueprint-images/{}/exports/wall", image_id), None, None).await;
    assert_eq!(walls["shapes"][0]["shape_type"], "rectangle");
    assert_eq!(walls["shapes"][0]["length"], 1.5);
}

#[tokio::test]
async fn deleting_image_cascades() {
    let app = build_test_app(&Detectors::standard());
    let owner = create_user(&app, "customer").await;
    let image_id = register_image(&app, owner, Some(100), Some(1.0)).await;
    send(&app, Method::POST, &format!("/blueprint-images/{}/annotate", image_id), Some(owner), None).await;
    wait_until_annotated(&app, image_id).await;

    let uri = format!("/blueprint-images/{}", image_id);
    let (status, _) = send(&app, Method::DELETE, &uri, Some(owner), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
    for kind in AnnotationKind::CHAIN {
        assert_eq!(app.store.count_annotations(image_id, kind).unwrap(), 0);
    }
}

#[tokio::test]
async fn register_rejects_bad_image_payload() {
    let app = build_test_app(&Detectors::standard());
    let owner = create_user(&app, "customer").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/blueprint-images",
        None,
        Some(json!({ "title": "x", "owner_id": owner, "image": "bm90IGFuIGltYWdl" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BAD_REQUEST");
}
