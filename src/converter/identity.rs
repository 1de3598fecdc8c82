//! Steps for kinds whose shape never changed

use super::{Converter, Kind, VERSIONS};
use crate::error::Result;
use serde_json::Value;

fn unchanged(_: &mut Value) -> Result<()> {
    Ok(())
}

pub(super) fn register(converter: &mut Converter, kind: Kind) {
    for pair in VERSIONS.windows(2) {
        converter.register(kind, pair[0], pair[1], unchanged, unchanged);
    }
}
