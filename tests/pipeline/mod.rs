mod detector_flow;
mod distributor_flow;
mod runner;
