mod bbox;
mod nms;
pub mod palette;

pub use crate::bbox::{Bbox, Detection};
pub use crate::nms::{do_nms_sort, filter_confident};
