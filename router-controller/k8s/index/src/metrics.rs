use crate::SharedState;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedState);

pub fn register(reg: &mut Registry, state: SharedState) {
    reg.register_collector(Box::new(Instrumented(state)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let service_unit_encoder = encoder.encode_descriptor(
            "service_units",
            "The number of service units in the router state",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.service_units_len() as u32).encode(service_unit_encoder)?;

        let route_encoder = encoder.encode_descriptor(
            "routes",
            "The number of admitted routes in the router state",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.routes_len() as u32).encode(route_encoder)?;

        let generation_encoder = encoder.encode_descriptor(
            "generation",
            "The number of changes applied to the router state",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.generation() as i64).encode(generation_encoder)?;

        Ok(())
    }
}
