// SPDX-License-Identifier: Apache-2.0

pub mod file;

use opentelemetry::global;
use opentelemetry::metrics::Meter;

// Instruments are no-ops until a MeterProvider is installed.
pub fn get_meter() -> Meter {
    global::meter("filestream")
}
