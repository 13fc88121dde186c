#[path = "firmware/grbl/controller.rs"]
mod controller;
#[path = "firmware/grbl/response_parser.rs"]
mod response_parser;
#[path = "firmware/grbl/status_parser.rs"]
mod status_parser;
