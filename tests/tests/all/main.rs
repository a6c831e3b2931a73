mod balancing;
mod resiliency;
