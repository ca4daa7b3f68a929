pub mod bidirectional;
pub mod grunet;
pub mod model_parts;
