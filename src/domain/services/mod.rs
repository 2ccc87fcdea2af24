pub mod health_score;
mod load_balancer;

pub use health_score::{health_score, instance_condition, overall_health, InstanceCondition};
pub use load_balancer::{LoadBalancer, SelectionContext};
