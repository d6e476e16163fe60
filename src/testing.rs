use anyhow::Result;

use crate::{config::FleetConfig, service::Service};

pub struct TestService {
    pub service: Service,
}

impl TestService {
    pub fn new() -> Result<TestService> {
        let service = Service::new(FleetConfig::default())?;
        Ok(TestService { service })
    }
}
