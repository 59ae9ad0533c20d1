//! Config Parser/Validator/Merger (§4.1, §4.2): raw YAML in, a validated
//! [`model`] out, then policy-merged per project.

pub mod merger;
pub mod model;
pub mod parser;
pub mod validator;
