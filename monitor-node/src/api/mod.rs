use actix_web::web;

pub mod internal;
pub mod rest;
pub mod ws;

pub fn configure(cfg: &mut web::ServiceConfig) {
    rest::configure(cfg);
    internal::configure(cfg);
    cfg.route("/ws", web::get().to(ws::ws_route));
}
