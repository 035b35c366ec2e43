use std::sync::atomic::{AtomicUsize, Ordering};

use crate::app::{initialize_app, FirebaseApp, FirebaseAppSettings, FirebaseOptions};

/// Registers a new app for `project_id` under a name no other test uses, so
/// every test gets its own component container.
pub fn test_app(project_id: &str) -> FirebaseApp {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let options = FirebaseOptions {
        project_id: Some(project_id.to_string()),
        ..Default::default()
    };
    let settings = FirebaseAppSettings {
        name: Some(format!("test-app-{}", COUNTER.fetch_add(1, Ordering::SeqCst))),
        ..Default::default()
    };
    initialize_app(options, Some(settings)).unwrap()
}
