//! Integration tests for the HTTP API, driven directly through the Axum
//! router (no bound socket) against a small HDF5 fixture written to a temp
//! dir for each test.

mod helpers;

use helpers::TestHarness;

#[tokio::test]
async fn children_lists_top_level_group_sorted() {
    let h = TestHarness::new();
    let (status, body) = h.get("/files/sample.h5/children?path=/").await;
    assert_eq!(status, 200);
    assert!(body["success"].as_bool().unwrap());
    let children = body["children"].as_array().unwrap();
    let names: Vec<&str> = children.iter().map(|c| c["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["D1", "Grid", "Unnamed"]);
    let group = children.iter().find(|c| c["name"] == "Unnamed").unwrap();
    assert_eq!(group["kind"], "group");
}

#[tokio::test]
async fn meta_reports_shape_and_type_for_a_dataset() {
    let h = TestHarness::new();
    let (status, body) =
        h.get("/files/sample.h5/meta?path=/Unnamed/Connections").await;
    assert_eq!(status, 200);
    let node = &body["node"];
    assert_eq!(node["kind"], "dataset");
    assert_eq!(node["shape"], serde_json::json!([18, 4]));
    assert_eq!(node["ndim"], 2);
    assert_eq!(node["size"], 72);
    assert_eq!(node["dtype"], "int32");
    assert_eq!(node["type"]["class"], "Integer");
    assert_eq!(node["type"]["signed"], true);
    assert_eq!(node["type"]["size"], 32);
}

#[tokio::test]
async fn matrix_mode_returns_full_contiguous_block() {
    let h = TestHarness::new();
    let (status, body) = h
        .get(
            "/files/sample.h5/data?path=/Unnamed/Connections&mode=matrix\
             &row_offset=0&row_limit=18&col_offset=0&col_limit=4",
        )
        .await;
    assert_eq!(status, 200);
    let result = &body["result"];
    assert_eq!(result["row_offset"], 0);
    assert_eq!(result["row_limit"], 18);
    assert_eq!(result["col_offset"], 0);
    assert_eq!(result["col_limit"], 4);
    let data = result["data"].as_array().unwrap();
    assert_eq!(data.len(), 18);
    assert_eq!(data[0].as_array().unwrap().len(), 4);
    assert_eq!(data[0][0], 0);
    assert_eq!(data[17][3], 71);
}

#[tokio::test]
async fn matrix_mode_is_idempotent() {
    let h = TestHarness::new();
    let uri = "/files/sample.h5/data?path=/Grid&mode=matrix&row_offset=2&row_limit=5&col_offset=1&col_limit=6";
    let (_, first) = h.get(uri).await;
    let (_, second) = h.get(uri).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn line_mode_overview_matches_ceil_downsample_law() {
    let h = TestHarness::new();
    let (status, body) = h
        .get("/files/sample.h5/data?path=/D1&mode=line&quality=overview&max_points=100")
        .await;
    assert_eq!(status, 200);
    let result = &body["result"];
    assert_eq!(result["line_step"], 100);
    assert_eq!(result["returned_points"], 100);
    assert_eq!(result["line_offset"], 0);
    assert_eq!(result["data"].as_array().unwrap().len(), 100);
}

#[tokio::test]
async fn heatmap_mode_clamps_to_effective_max_size() {
    let h = TestHarness::new();
    let (status, body) = h
        .get("/files/sample.h5/data?path=/Grid&mode=heatmap&max_size=16&include_stats=true")
        .await;
    assert_eq!(status, 200);
    let result = &body["result"];
    assert_eq!(result["effective_max_size"], 16);
    let data = result["data"].as_array().unwrap();
    assert!(data.len() <= 16);
    assert!(data[0].as_array().unwrap().len() <= 16);
    assert!(result["stats"].is_object());
}

#[tokio::test]
async fn preview_on_two_d_dataset_decimates_both_axes() {
    let h = TestHarness::new();
    let (status, body) = h.get("/files/sample.h5/preview?path=/Grid").await;
    assert_eq!(status, 200);
    let result = &body["result"];
    assert_eq!(result["shape"], serde_json::json!([50, 80]));
    assert!(result["table"].is_object());
}

#[tokio::test]
async fn csv_export_streams_header_then_rows() {
    let h = TestHarness::new();
    let (status, text) = h
        .get_text("/files/sample.h5/export/csv?path=/Unnamed/Connections&mode=matrix")
        .await;
    assert_eq!(status, 200);
    let mut lines = text.lines();
    assert_eq!(lines.next().unwrap(), "row\\col,0,1,2,3");
    assert_eq!(lines.next().unwrap(), "0,0,1,2,3");
}

#[tokio::test]
async fn path_traversal_in_key_is_forbidden() {
    let h = TestHarness::new();
    let (status, body) = h.get("/files/..%2fetc%2fpasswd/children?path=/").await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "FORBIDDEN");
}

#[tokio::test]
async fn bad_selection_reports_400_with_stable_code() {
    let h = TestHarness::new();
    let (status, body) = h
        .get("/files/sample.h5/data?path=/Unnamed/Connections&mode=matrix&row_offset=0&row_limit=18&col_offset=0&col_limit=4&display_dims=0,0")
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "BAD_SELECTION");
}

#[tokio::test]
async fn exact_line_request_over_budget_is_range_too_large() {
    let h = helpers::TestHarness::with_limits(h5gate_core::config::LimitsConfig {
        max_extract_elements: 25_000_000,
        exact_line_points: 100,
        heatmap_max_side: 1024,
        concurrent_requests: 32,
    });
    let (status, body) = h
        .get("/files/sample.h5/data?path=/D1&mode=line&quality=exact&line_dim=0&max_points=5")
        .await;
    assert_eq!(status, 413);
    assert_eq!(body["code"], "RANGE_TOO_LARGE");
}

#[tokio::test]
async fn exact_line_request_within_configured_ceiling_succeeds() {
    let h = helpers::TestHarness::with_limits(h5gate_core::config::LimitsConfig {
        max_extract_elements: 25_000_000,
        exact_line_points: 20_000,
        heatmap_max_side: 1024,
        concurrent_requests: 32,
    });
    let (status, body) = h
        .get("/files/sample.h5/data?path=/D1&mode=line&quality=exact&line_dim=0")
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["returned_points"], 10_000);
}

#[tokio::test]
async fn stale_etag_is_reported_then_a_retry_sees_fresh_data() {
    let h = TestHarness::new();
    let (status, body) = h.get("/files/sample.h5/meta?path=/D1").await;
    assert_eq!(status, 200);

    // Modify the file so its freshness token changes.
    std::thread::sleep(std::time::Duration::from_millis(10));
    let file = hdf5::File::append(h.fixture_path()).unwrap();
    file.new_dataset::<i32>().shape(1).create("touch").unwrap();
    drop(file);

    let stale_etag = body["node"]["shape"].to_string(); // not a real token, just "an old value"
    let (status, body) = h
        .get(&format!("/files/sample.h5/meta?path=/D1&etag={stale_etag}"))
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["code"], "STALE");

    let (status, _) = h.get("/files/sample.h5/meta?path=/D1").await;
    assert_eq!(status, 200);
}
