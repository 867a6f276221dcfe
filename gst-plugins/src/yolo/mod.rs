use gst::glib;
use gst::prelude::*;

pub mod darknet;
mod imp;

glib::wrapper! {
    pub struct Yolo(ObjectSubclass<imp::Yolo>) @extends gst_base::BaseTransform, gst::Element, gst::Object;
}

unsafe impl Send for Yolo {}
unsafe impl Sync for Yolo {}

pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "yolo",
        gst::Rank::None,
        Yolo::static_type(),
    )
}
