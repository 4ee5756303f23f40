// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use apartment_rt::notification::NotificationCenter;
use apartment_rt::{Apartment, AsyncContext, main};

#[main]
fn main(apartment: Apartment) {
    let center = NotificationCenter::new();

    center
        .add_observer(
            "logger",
            "build.*",
            apartment.clone(),
            AsyncContext::empty(),
            |sender, name, _data| {
                println!("{sender} posted {name}");
            },
        )
        .unwrap();

    center.post_notification("ci", "build.started", Arc::new(()), &AsyncContext::empty());
    center.post_notification("ci", "build.finished", Arc::new(()), &AsyncContext::empty());
    center.post_notification("ci", "deploy.started", Arc::new(()), &AsyncContext::empty());
}
