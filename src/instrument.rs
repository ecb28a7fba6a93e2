// Copyright (c) 2023 Franco Solleza, Intel Corporation, Brown University
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

use crate::constants::PANIC_ON_INVARIANT_VIOLATION_ENV;
use crate::counters::INVARIANT_VIOLATIONS;
use lazy_static::lazy_static;
use log::error;

lazy_static! {
    static ref PANIC_ON_INVARIANT_VIOLATION: bool = std::env::var(PANIC_ON_INVARIANT_VIOLATION_ENV)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
}

/// Reports a state that should be unreachable. Counted and logged; the caller
/// treats the operation as a no-op. Panics only when the process opted in via
/// `PANIC_ON_INVARIANT_VIOLATION=true`.
pub fn emit_and_log_invariant_violation(msg: &str) {
    INVARIANT_VIOLATIONS.increment(1);
    error!("invariant violated: {}", msg);
    if *PANIC_ON_INVARIANT_VIOLATION {
        panic!("invariant violated: {}", msg);
    }
}
