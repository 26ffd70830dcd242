 use std::future::Future;
 use std::time::Duration;

 use tokio::task::JoinHandle;

 /// Dropping a `Timer` does not cancel it; call [`Timer::cancel`]. A fired
 /// one-shot timer that is dropped afterwards is simply forgotten.
 #[derive(Debug)]
 pub struct Timer {
     handle: JoinHandle<()>,
 }

 impl Timer {
     pub fn once<F, Fut>(delay: Duration, f: F) -> Self
     where
         F: FnOnce() -> Fut + Send + 'static,
         Fut: Future<Output = ()> + Send + 'static,
     {
         let handle = tokio::spawn(async move {
             tokio::time::sleep(delay).await;
             f().await;
         });
         Self { handle }
     }

     pub fn every<F, Fut>(period: Duration, mut f: F) -> Self
     where
         F: FnMut() -> Fut + Send + 'static,
         Fut: Future<Output = ()> + Send + 'static,
     {
         let handle = tokio::spawn(async move {
             let start = tokio::time::Instant::now() + period;
             let mut tick = tokio::time::interval_at(start, period);
             tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
             loop {
                 tick.tick().await;
                 f().await;
             }
         });
         Self { handle }
     }

     pub fn cancel(self) {
         self.handle.abort();
     }
 }
