//! A minimal "Hello, World!" server using Waypoint
//!
//! This demo creates a basic server that responds with "Hello, World!" on `/`.

use waypoint::Application;

fn main() {
    tracing_subscriber::fmt().init();

    let mut app = Application::new();

    // Add a route that handles GET requests to "/"
    app.get("/", |ctx| Box::pin(async move { ctx.res.text("Hello, World!") }))
        .expect("valid route");

    app.listen("127.0.0.1:3000", |addr| println!("Listening on http://{addr}"))
        .expect("Server failed to start");
}
