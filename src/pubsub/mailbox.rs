use std::time::Duration;

use courier_error::{RecvError, TryRecvError};
use tokio::{
    sync::{
        mpsc::{
            self,
            error::{SendTimeoutError, TrySendError},
        },
        watch, Mutex,
    },
    time::{self, Instant},
};

use super::Delivery;

/// Почему доставка не попала в почтовый ящик.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueError {
    /// Ящик оставался полным дольше таймаута постановки.
    Timeout,
    /// Подписка удалена, ящик закрыт.
    Closed,
}

/// Ограниченный почтовый ящик подписки.
///
/// Когда ящик полон, отправитель ждёт свободного места не дольше
/// таймаута; медленный подписчик тормозит только собственные доставки.
/// Закрытие будит и ожидающих отправителей, и ожидающих получателей.
pub(crate) struct Mailbox {
    tx: mpsc::Sender<Delivery>,
    rx: Mutex<mpsc::Receiver<Delivery>>,
    closed: watch::Sender<bool>,
    capacity: usize,
}

impl Mailbox {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (closed, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed,
            capacity,
        }
    }

    /// Кладёт доставку в ящик, ожидая места не дольше `wait`.
    pub(crate) async fn enqueue(
        &self,
        delivery: Delivery,
        wait: Duration,
    ) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }

        let delivery = match self.tx.try_send(delivery) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(EnqueueError::Closed),
            Err(TrySendError::Full(delivery)) => delivery,
        };

        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => Err(EnqueueError::Closed),
            sent = self.tx.send_timeout(delivery, wait) => match sent {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => Err(EnqueueError::Timeout),
                Err(SendTimeoutError::Closed(_)) => Err(EnqueueError::Closed),
            },
        }
    }

    /// Ждёт следующую доставку до `deadline`.
    pub(crate) async fn recv(
        &self,
        deadline: Instant,
    ) -> Result<Delivery, RecvError> {
        let mut closed = self.closed.subscribe();
        let next = async {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => Err(RecvError::SubscriptionClosed),
                delivery = rx.recv() => delivery.ok_or(RecvError::SubscriptionClosed),
            }
        };

        match time::timeout_at(deadline, next).await {
            Ok(result) => result,
            Err(_) => Err(RecvError::Timeout),
        }
    }

    /// Забирает доставку, если она уже лежит в ящике.
    ///
    /// Если ящик сейчас читает другой получатель, возвращает `Empty`.
    pub(crate) fn try_recv(&self) -> Result<Delivery, TryRecvError> {
        if self.is_closed() {
            return Err(TryRecvError::SubscriptionClosed);
        }
        let Ok(mut rx) = self.rx.try_lock() else {
            return Err(TryRecvError::Empty);
        };
        rx.try_recv().map_err(|err| match err {
            mpsc::error::TryRecvError::Empty => TryRecvError::Empty,
            mpsc::error::TryRecvError::Disconnected => TryRecvError::SubscriptionClosed,
        })
    }

    /// Закрывает ящик. Идемпотентно.
    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Число доставок, ожидающих получения.
    pub(crate) fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|is_closed| *is_closed).await;
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
