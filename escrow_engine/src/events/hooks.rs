use std::{future::Future, pin::Pin, sync::Arc};

use crate::events::{EscrowMovedEvent, EventHandler, EventProducer, Handler, OrderAnnulledEvent, OrderPaidEvent};

/// The producer side of the registered hooks. API objects hold a copy and publish into every producer of the right
/// kind.
#[derive(Default, Clone)]
pub struct EventProducers {
    pub order_paid_producer: Vec<EventProducer<OrderPaidEvent>>,
    pub order_annulled_producer: Vec<EventProducer<OrderAnnulledEvent>>,
    pub escrow_moved_producer: Vec<EventProducer<EscrowMovedEvent>>,
}

impl EventProducers {
    pub async fn publish_order_paid(&self, event: OrderPaidEvent) {
        for p in &self.order_paid_producer {
            p.publish_event(event.clone()).await;
        }
    }

    pub async fn publish_order_annulled(&self, event: OrderAnnulledEvent) {
        for p in &self.order_annulled_producer {
            p.publish_event(event.clone()).await;
        }
    }

    pub async fn publish_escrow_moved(&self, event: EscrowMovedEvent) {
        for p in &self.escrow_moved_producer {
            p.publish_event(event.clone()).await;
        }
    }
}

pub struct EventHandlers {
    pub on_order_paid: Option<EventHandler<OrderPaidEvent>>,
    pub on_order_annulled: Option<EventHandler<OrderAnnulledEvent>>,
    pub on_escrow_moved: Option<EventHandler<EscrowMovedEvent>>,
}

impl EventHandlers {
    pub fn new(buffer_size: usize, hooks: EventHooks) -> Self {
        let on_order_paid = hooks.on_order_paid.map(|f| EventHandler::new(buffer_size, f));
        let on_order_annulled = hooks.on_order_annulled.map(|f| EventHandler::new(buffer_size, f));
        let on_escrow_moved = hooks.on_escrow_moved.map(|f| EventHandler::new(buffer_size, f));
        Self { on_order_paid, on_order_annulled, on_escrow_moved }
    }

    pub fn producers(&self) -> EventProducers {
        let mut result = EventProducers::default();
        if let Some(handler) = &self.on_order_paid {
            result.order_paid_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_order_annulled {
            result.order_annulled_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_escrow_moved {
            result.escrow_moved_producer.push(handler.subscribe());
        }
        result
    }

    pub async fn start_handlers(self) {
        if let Some(handler) = self.on_order_paid {
            tokio::spawn(async move {
                handler.start_handler().await;
            });
        }
        if let Some(handler) = self.on_order_annulled {
            tokio::spawn(async move {
                handler.start_handler().await;
            });
        }
        if let Some(handler) = self.on_escrow_moved {
            tokio::spawn(async move {
                handler.start_handler().await;
            });
        }
    }
}

type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default, Clone)]
pub struct EventHooks {
    pub on_order_paid: Option<Handler<OrderPaidEvent>>,
    pub on_order_annulled: Option<Handler<OrderAnnulledEvent>>,
    pub on_escrow_moved: Option<Handler<EscrowMovedEvent>>,
}

impl EventHooks {
    pub fn on_order_paid<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(OrderPaidEvent) -> HookFuture) + Send + Sync + 'static {
        self.on_order_paid = Some(Arc::new(f));
        self
    }

    pub fn on_order_annulled<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(OrderAnnulledEvent) -> HookFuture) + Send + Sync + 'static {
        self.on_order_annulled = Some(Arc::new(f));
        self
    }

    pub fn on_escrow_moved<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(EscrowMovedEvent) -> HookFuture) + Send + Sync + 'static {
        self.on_escrow_moved = Some(Arc::new(f));
        self
    }
}
