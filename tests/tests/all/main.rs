mod load_balanced_channel;
