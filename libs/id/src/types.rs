//! Typed ID definitions for fleet resources.

use crate::define_id;

// Workers and deployments
define_id!(WorkerId, "wkr");
define_id!(DeploymentId, "dep");

// Runtime instances and routing
define_id!(InstanceId, "inst");
define_id!(EndpointId, "ep");

// Requests
define_id!(RequestId, "req");
