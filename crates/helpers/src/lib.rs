pub mod k8s_helpers;
pub mod wait;
