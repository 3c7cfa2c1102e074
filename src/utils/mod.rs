pub mod fs_utils;

use std::path::Path;

use crate::common::VALID_IMAGE_EXTENSIONS;

pub trait PathExt {
    fn ext_lower(&self) -> String;
    fn is_image(&self) -> bool;
}

impl PathExt for Path {
    fn ext_lower(&self) -> String {
        self.extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default()
    }

    fn is_image(&self) -> bool {
        VALID_IMAGE_EXTENSIONS.contains(&self.ext_lower().as_str())
    }
}
