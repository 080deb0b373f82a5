#[macro_use] extern crate rocket;

use rocket::serde::json::Json;
use rocket::serde::Serialize;

#[cfg(test)]
mod tests;
mod auth;
mod booking;
mod db;
mod engine;
mod error;
mod notify;
mod seed;
mod session;
mod util;
mod waitlist;

#[derive(Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
}

#[get("/")]
fn index() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[launch]
fn rocket() -> _ {
    let rocket = rocket::build()
        .attach(db::DbPoolFairing())
        .attach(notify::stage())
        .mount("/", routes![
            index,
        ]);
    let rocket = session::extend(rocket);
    let rocket = engine::extend(rocket);
    let rocket = notify::extend(rocket);
    seed::extend(rocket)
}
