//! Store-and-forward switch with one urgency-based scheduler per egress port.

use crate::{
    scheduler::{Scheduler, Ubs},
    telemetry::Results,
    Address, Environment, Error, Frame, Node, Wakeup,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use tracing::debug;
use ubsim_runtime::{
    interrupt::{self, Interruptible},
    Metrics as _, Spawner,
};

pub use crate::scheduler::Config;

/// A switch that shapes and forwards frames along their flow's path.
///
/// The egress scheduler (and its transmission task) for a neighbor is created the first time a
/// frame must be forwarded to it.
pub struct Switch {
    env: Environment,
    address: Address,
    cfg: Config,

    egress: Mutex<BTreeMap<Address, Ubs>>,
}

impl Switch {
    pub fn new(env: &Environment, address: impl Into<Address>, cfg: Config) -> Arc<Self> {
        Arc::new(Self {
            env: env.clone(),
            address: address.into(),
            cfg,
            egress: Mutex::new(BTreeMap::new()),
        })
    }

    /// Scheduler of the port toward `receiver`, created on first use.
    fn egress(&self, receiver: &Address) -> Result<Ubs, Error> {
        let mut egress = self.egress.lock().unwrap();
        if let Some(scheduler) = egress.get(receiver) {
            return Ok(scheduler.clone());
        }
        let bandwidth = self.env.topology()?.bandwidth(&self.address, receiver)?;
        let (interrupter, idle) = interrupt::channel();
        let scheduler = Ubs::new(&self.env, self.cfg.clone(), bandwidth, interrupter);
        self.env.context().with_label("egress").spawn({
            let env = self.env.clone();
            let address = self.address.clone();
            let receiver = receiver.clone();
            let scheduler = scheduler.clone();
            move |_| async move {
                if let Err(err) = transmit(&env, &address, &receiver, scheduler, idle).await {
                    env.fail(err);
                }
            }
        });
        debug!(address = %self.address, %receiver, bandwidth, "egress created");
        egress.insert(receiver.clone(), scheduler.clone());
        Ok(scheduler)
    }
}

/// Serve the egress toward `receiver`: send the highest-priority eligible frame, wait for it to
/// arrive, and repeat. Transmissions are never preempted.
async fn transmit(
    env: &Environment,
    address: &Address,
    receiver: &Address,
    scheduler: Ubs,
    mut idle: Interruptible<Wakeup>,
) -> Result<(), Error> {
    loop {
        let Some(frame) = scheduler.peek_frame() else {
            idle.wait().await;
            continue;
        };
        scheduler.start_transmission(&frame);
        let traffic_class = scheduler.traffic_class(&frame);
        env.send_frame(address, receiver, frame.clone(), 0.0, Some(traffic_class))?
            .await?;
        scheduler.end_transmission(&frame);
    }
}

impl Node for Switch {
    fn address(&self) -> &Address {
        &self.address
    }

    fn environment(&self) -> &Environment {
        &self.env
    }

    fn on_frame_received(
        &self,
        frame: Arc<Frame>,
        sender: &Address,
        traffic_class: u8,
    ) -> Result<(), Error> {
        let next_hops = frame.flow().path().next_hops(&self.address);
        if next_hops.is_empty() {
            debug!(address = %self.address, frame = frame.id(), "no next hop");
            return Ok(());
        }
        for receiver in next_hops {
            self.egress(receiver)?
                .append_frame(frame.clone(), sender, traffic_class)?;
        }
        Ok(())
    }

    fn monitored(&self) -> bool {
        self.cfg.monitor
    }

    fn telemetry(&self) -> Results {
        let mut results = Results::default();
        for (receiver, scheduler) in self.egress.lock().unwrap().iter() {
            results.extend(scheduler.telemetry(&self.address, receiver));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        scheduler::{Classification, Mode},
        Flow, Listener, Path, PriorityMap, Run, Topology,
    };
    use commonware_macros::test_traced;
    use ubsim_runtime::{deterministic::Executor, Clock, Runner};

    #[test_traced]
    fn test_forwards_in_priority_order() {
        let (executor, context) = Executor::default();
        let env = Environment::new(context, Run::default(), Default::default());
        let mut cfg = Config::new(PriorityMap::new(2).unwrap(), Mode::Shapeless);
        cfg.monitor = true;
        let switch = Switch::new(&env, "s", cfg);
        let listener = Listener::new(&env, "l");
        let mut topology = Topology::default();
        topology.add(Listener::new(&env, "t")).unwrap();
        topology.add(switch.clone()).unwrap();
        topology.add(listener.clone()).unwrap();
        topology.multi_connect("s", 100.0, ["t", "l"]).unwrap();
        env.install(topology).unwrap();

        let path = Path::new(["t", "s", "l"]).unwrap();
        let flow = Arc::new(Flow::new(1, path, 100.0, 1500.0).unwrap());
        let frames: Vec<_> = [0, 0, 7]
            .into_iter()
            .map(|priority| Arc::new(Frame::with_header(env.frame_id(), flow.clone(), 100, 0, priority)))
            .collect();
        executor
            .start({
                let switch = switch.clone();
                let frames = frames.clone();
                |context| async move {
                    // The first low frame occupies the link before the others arrive
                    let sender = Address::from("t");
                    switch.push_frame(frames[0].clone(), &sender, 0).unwrap();
                    context.sleep(1.0).await;
                    switch.push_frame(frames[1].clone(), &sender, 0).unwrap();
                    switch.push_frame(frames[2].clone(), &sender, 7).unwrap();
                    context.sleep(100.0).await;
                }
            })
            .unwrap();

        // Each frame takes 8us; the high frame overtakes the second low frame
        let arrivals: Vec<_> = listener.arrivals().iter().map(|a| (a.frame, a.time)).collect();
        assert_eq!(arrivals, vec![(0, 8.0), (2, 16.0), (1, 24.0)]);

        // Forwarded with the mapped traffic class
        assert_eq!(frames[2].traffic_class(), 1);
        assert_eq!(frames[0].traffic_class(), 0);

        let results = switch.telemetry();
        let delays: Vec<_> = results
            .switch
            .iter()
            .map(|r| (r.frame_id, r.nodal_delay.unwrap(), r.queue_delay.unwrap()))
            .collect();
        assert_eq!(delays, vec![(0, 8.0, 0.0), (1, 23.0, 15.0), (2, 15.0, 7.0)]);
    }

    #[test]
    fn test_multicast_fan_out() {
        let (executor, context) = Executor::default();
        let env = Environment::new(context, Run::default(), Default::default());
        let mut cfg = Config::new(PriorityMap::new(1).unwrap(), Mode::Lrq);
        cfg.monitor = true;
        let switch = Switch::new(&env, "s", cfg);
        let (l1, l2) = (Listener::new(&env, "l1"), Listener::new(&env, "l2"));
        let mut topology = Topology::default();
        topology.add(Listener::new(&env, "t")).unwrap();
        topology.add(switch.clone()).unwrap();
        topology.add(l1.clone()).unwrap();
        topology.add(l2.clone()).unwrap();
        topology.connect("s", "t", 1000.0).unwrap();
        topology.connect("s", "l1", 100.0).unwrap();
        topology.connect("s", "l2", 200.0).unwrap();
        env.install(topology).unwrap();

        let mut path = Path::new(["t", "s", "l1"]).unwrap();
        path.append(["t", "s", "l2"]).unwrap();
        let flow = Arc::new(Flow::new(1, path, 100.0, 1500.0).unwrap());
        let frame = Arc::new(Frame::with_header(env.frame_id(), flow, 100, 0, 0));
        executor
            .start({
                let switch = switch.clone();
                let frame = frame.clone();
                |context| async move {
                    switch.push_frame(frame, &"t".into(), 0).unwrap();
                    context.sleep(100.0).await;
                }
            })
            .unwrap();

        // One scheduler per branch
        let results = switch.telemetry();
        let egress: Vec<_> = results.switch.iter().map(|r| r.egress_address.as_str()).collect();
        assert_eq!(egress, vec!["l1", "l2"]);

        // Independent delays per terminal
        assert_eq!(l1.arrivals().len(), 1);
        assert_eq!(l2.arrivals().len(), 1);
        assert_eq!(frame.delay(&"l1".into()), Some(8.0));
        assert_eq!(frame.delay(&"l2".into()), Some(4.0));
        assert_eq!(frame.delay(&"s".into()), None);
        assert_eq!(frame.delays().len(), 2);
    }

    #[test_traced]
    fn test_reclassification_uses_upstream_link_class() {
        let (executor, context) = Executor::default();
        let env = Environment::new(context, Run::default(), Default::default());
        let switch = |address: &str, classes: u8, classification: Classification| {
            let mut cfg = Config::new(PriorityMap::new(classes).unwrap(), Mode::Shapeless);
            cfg.classification = classification;
            cfg.monitor = true;
            Switch::new(&env, address, cfg)
        };

        // The two branches forward the same frame with different classes
        let s = switch("s", 8, Classification::Sender);
        let x = switch("x", 2, Classification::Sender);
        let y = switch("y", 8, Classification::Sender);
        let z1 = switch("z1", 8, Classification::SenderAndClass);
        let z2 = switch("z2", 8, Classification::SenderAndClass);
        let (l1, l2) = (Listener::new(&env, "l1"), Listener::new(&env, "l2"));
        let mut topology = Topology::default();
        topology.add(Listener::new(&env, "t")).unwrap();
        for node in [&s, &x, &y, &z1, &z2] {
            topology.add(node.clone()).unwrap();
        }
        topology.add(l1.clone()).unwrap();
        topology.add(l2.clone()).unwrap();
        topology.connect("t", "s", 1000.0).unwrap();
        topology.connect("s", "x", 1000.0).unwrap();
        topology.connect("s", "y", 100.0).unwrap();
        topology.connect("x", "z1", 100.0).unwrap();
        topology.connect("y", "z2", 100.0).unwrap();
        topology.connect("z1", "l1", 1000.0).unwrap();
        topology.connect("z2", "l2", 1000.0).unwrap();
        env.install(topology).unwrap();

        let mut path = Path::new(["t", "s", "x", "z1", "l1"]).unwrap();
        path.append(["t", "s", "y", "z2", "l2"]).unwrap();
        let flow = Arc::new(Flow::new(1, path, 100.0, 1500.0).unwrap());
        let frame = Arc::new(Frame::with_header(env.frame_id(), flow, 100, 0, 7));
        executor
            .start({
                let s = s.clone();
                let frame = frame.clone();
                |context| async move {
                    s.push_frame(frame, &"t".into(), 7).unwrap();
                    context.sleep(100.0).await;
                }
            })
            .unwrap();

        // x sends with class 1 and its frame reaches z1 (at 8.8us) after y started sending
        // with class 7 (at 8us)
        let queues = |switch: &Switch| -> Vec<String> {
            switch
                .telemetry()
                .switch
                .into_iter()
                .map(|r| r.shaped_queue)
                .collect()
        };
        assert_eq!(queues(&z1), vec!["7-x-1".to_string()]);
        assert_eq!(queues(&z2), vec!["7-y-7".to_string()]);

        // Each listener sees the class of its own incoming link
        assert_eq!(l1.arrivals()[0].traffic_class, 7);
        assert_eq!(l2.arrivals()[0].traffic_class, 7);
        assert_eq!(frame.delays().len(), 2);
    }

    #[test]
    fn test_missing_link() {
        let (_, context) = Executor::default();
        let env = Environment::new(context, Run::default(), Default::default());
        let switch = Switch::new(
            &env,
            "s",
            Config::new(PriorityMap::new(1).unwrap(), Mode::Lrq),
        );
        let mut topology = Topology::default();
        topology.add(switch.clone()).unwrap();
        topology.add(Listener::new(&env, "l")).unwrap();
        env.install(topology).unwrap();

        let path = Path::new(["t", "s", "l"]).unwrap();
        let flow = Arc::new(Flow::new(1, path, 100.0, 1500.0).unwrap());
        let frame = Arc::new(Frame::new(env.frame_id(), flow, 100, 0));
        let result = switch.push_frame(frame, &"t".into(), 0);
        assert!(matches!(result, Err(Error::UnknownLink(_, _))));
    }
}
