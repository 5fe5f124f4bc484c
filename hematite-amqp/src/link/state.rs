//! Link flow state shared between a link endpoint and its session relay

use fe2o3_amqp_types::{
    definitions::SequenceNo,
    performatives::Flow,
};
use parking_lot::RwLock;
use tokio::sync::Notify;

#[derive(Debug)]
pub(crate) struct LinkFlowStateInner {
    pub initial_delivery_count: SequenceNo,
    pub delivery_count: SequenceNo,
    pub link_credit: u32,
    pub available: u32,
    pub drain: bool,
}

/// Flow state shared between the session event loop (which applies incoming
/// Flow frames) and the sender or receiver endpoint.
///
/// The notifier wakes a sender that ran out of credit. There is exactly one
/// credit consumer per link, so a stored permit is never lost.
#[derive(Debug)]
pub(crate) struct LinkFlowState {
    lock: RwLock<LinkFlowStateInner>,
    notifier: Notify,
}

pub(crate) struct InsufficientCredit {}

impl LinkFlowState {
    pub fn new(initial_delivery_count: SequenceNo) -> Self {
        Self {
            lock: RwLock::new(LinkFlowStateInner {
                initial_delivery_count,
                delivery_count: initial_delivery_count,
                link_credit: 0,
                available: 0,
                drain: false,
            }),
            notifier: Notify::new(),
        }
    }

    pub fn link_credit(&self) -> u32 {
        self.lock.read().link_credit
    }

    pub fn delivery_count(&self) -> SequenceNo {
        self.lock.read().delivery_count
    }

    pub fn set_link_credit(&self, credit: u32) {
        self.lock.write().link_credit = credit;
    }

    /// Synchronizes the delivery count with the value the peer announced
    pub fn set_delivery_count(&self, count: SequenceNo) {
        self.lock.write().delivery_count = count;
    }

    /// Handles an incoming Flow on a sender link.
    ///
    /// The sender's link-credit is computed per the flow control formula in
    /// Part 2.6.7:
    /// `link-credit_snd := delivery-count_rcv + link-credit_rcv - delivery-count_snd`.
    /// If the receiver requested a drain or an echo, the state to reply
    /// with is returned.
    pub fn on_incoming_flow_as_sender(&self, flow: &Flow, output_handle: u32) -> Option<Flow> {
        let mut state = self.lock.write();

        let delivery_count_rcv = flow.delivery_count.unwrap_or(
            // If the receiver does not yet know the delivery-count it is
            // assumed to be the initial delivery-count of the sender
            state.initial_delivery_count,
        );

        if let Some(link_credit_rcv) = flow.link_credit {
            state.link_credit = delivery_count_rcv
                .saturating_add(link_credit_rcv)
                .wrapping_sub(state.delivery_count);
        }

        state.drain = flow.drain;
        if flow.drain {
            // Advance the delivery-count to consume all credit and report
            // the new state back to the receiver
            state.delivery_count = state.delivery_count.wrapping_add(state.link_credit);
            state.link_credit = 0;
            return Some(as_link_flow(&state, output_handle, false));
        }

        self.notifier.notify_one();

        match flow.echo {
            true => Some(as_link_flow(&state, output_handle, false)),
            false => None,
        }
    }

    /// Handles an incoming Flow on a receiver link
    pub fn on_incoming_flow_as_receiver(&self, flow: &Flow, output_handle: u32) -> Option<Flow> {
        let mut state = self.lock.write();

        if let Some(delivery_count) = flow.delivery_count {
            state.delivery_count = delivery_count;
        }
        if let Some(available) = flow.available {
            state.available = available;
        }

        match flow.echo {
            true => Some(as_link_flow(&state, output_handle, false)),
            false => None,
        }
    }

    /// Consumes link credit on the sender side, waiting asynchronously when
    /// there is not enough. Returns the delivery tag derived from the
    /// delivery count.
    pub async fn consume_credit_as_sender(&self, count: u32) -> [u8; 4] {
        loop {
            match self.try_consume(count) {
                Ok(tag) => return tag,
                Err(InsufficientCredit {}) => self.notifier.notified().await,
            }
        }
    }

    /// Consumes link credit on the receiver side without waiting
    pub fn try_consume(&self, count: u32) -> Result<[u8; 4], InsufficientCredit> {
        let mut state = self.lock.write();
        if state.link_credit < count {
            Err(InsufficientCredit {})
        } else {
            let tag = state.delivery_count.to_be_bytes();
            state.delivery_count = state.delivery_count.wrapping_add(count);
            state.link_credit -= count;
            Ok(tag)
        }
    }
}

fn as_link_flow(state: &LinkFlowStateInner, output_handle: u32, echo: bool) -> Flow {
    Flow {
        // session level fields are patched in by the session
        next_incoming_id: None,
        incoming_window: 0,
        next_outgoing_id: 0,
        outgoing_window: 0,
        handle: Some(output_handle.into()),
        delivery_count: Some(state.delivery_count),
        link_credit: Some(state.link_credit),
        available: Some(state.available),
        drain: state.drain,
        echo,
        properties: None,
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::performatives::Flow;

    use super::LinkFlowState;

    fn flow_with_credit(credit: u32) -> Flow {
        Flow {
            next_incoming_id: Some(0),
            incoming_window: 100,
            next_outgoing_id: 0,
            outgoing_window: 100,
            handle: Some(0.into()),
            delivery_count: Some(0),
            link_credit: Some(credit),
            available: None,
            drain: false,
            echo: false,
            properties: None,
        }
    }

    #[tokio::test]
    async fn sender_credit_follows_the_flow_control_formula() {
        let state = LinkFlowState::new(0);
        assert_eq!(state.link_credit(), 0);

        state.on_incoming_flow_as_sender(&flow_with_credit(10), 0);
        assert_eq!(state.link_credit(), 10);

        state.consume_credit_as_sender(3).await;
        assert_eq!(state.link_credit(), 7);
        assert_eq!(state.delivery_count(), 3);

        // A flow computed against the already advanced delivery count
        state.on_incoming_flow_as_sender(&flow_with_credit(10), 0);
        assert_eq!(state.link_credit(), 7);
    }

    #[tokio::test]
    async fn drain_consumes_all_credit_and_replies() {
        let state = LinkFlowState::new(0);
        state.on_incoming_flow_as_sender(&flow_with_credit(5), 0);

        let mut drain_flow = flow_with_credit(5);
        drain_flow.drain = true;
        let reply = state.on_incoming_flow_as_sender(&drain_flow, 0);

        let reply = reply.expect("drain must be answered with a flow");
        assert_eq!(reply.link_credit, Some(0));
        assert_eq!(state.link_credit(), 0);
        assert_eq!(state.delivery_count(), 5);
    }

    #[tokio::test]
    async fn consume_waits_until_credit_arrives() {
        use std::sync::Arc;
        use std::time::Duration;

        let state = Arc::new(LinkFlowState::new(0));
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.consume_credit_as_sender(1).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        state.on_incoming_flow_as_sender(&flow_with_credit(1), 0);

        let tag = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter should complete after credit arrives")
            .unwrap();
        assert_eq!(tag, 0u32.to_be_bytes());
    }
}
