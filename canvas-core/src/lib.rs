mod client;

pub use client::{
    ApiErrorClass, CanvasClient, CanvasError, Course, File, Folder, Page, parse_next_link,
};
